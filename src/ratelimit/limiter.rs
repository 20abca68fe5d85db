//! Token bucket rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::tier::RateLimitConfig;
use crate::error::Result;
use crate::store::{BucketStore, ConsumeRequest};

/// Prefix of bucket keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Machine-usable rate limit metadata, exposed to callers on every decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitMetadata {
    /// Tokens left after this request.
    pub remaining: f64,
    /// Bucket capacity.
    pub limit: u32,
    /// Seconds until at least one token is available.
    pub retry_after: f64,
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub metadata: RateLimitMetadata,
}

/// Trait for rate limiter implementations.
///
/// Check and consume are one operation: a separate peek followed by a
/// consume would race across gateway instances.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Refill the principal's bucket and take one token if available.
    ///
    /// Store failures are returned as errors, never turned into a decision.
    async fn is_allowed(
        &self,
        principal: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision>;

    /// Take one token without branching on the outcome.
    ///
    /// Same atomicity and failure contract as [`RateLimiter::is_allowed`].
    async fn consume_token(&self, principal: &str, config: &RateLimitConfig) -> Result<()> {
        self.is_allowed(principal, config).await.map(|_| ())
    }

    /// Check that the backing store is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Token bucket limiter over a [`BucketStore`].
///
/// Holds no state of its own; every bucket lives in the store, keyed by
/// `<prefix>:<principal>`.
pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter using the default `rate_limit` key prefix.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn BucketStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store key of a principal's bucket.
    pub fn bucket_key(&self, principal: &str) -> String {
        format!("{}:{}", self.key_prefix, principal)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn is_allowed(
        &self,
        principal: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision> {
        let key = self.bucket_key(principal);
        let request = ConsumeRequest {
            capacity: f64::from(config.burst_size()),
            refill_rate: config.refill_rate(),
            now: self.clock.now_secs(),
            requested: 1.0,
            ttl_secs: config.bucket_ttl().as_secs(),
        };

        trace!(key = %key, tier = %config.tier(), "Checking rate limit");

        let outcome = self.store.refill_and_consume(&key, request).await?;

        let metadata = RateLimitMetadata {
            remaining: outcome.tokens,
            limit: config.burst_size(),
            retry_after: config.retry_after(outcome.tokens),
        };

        if outcome.allowed {
            debug!(principal = %principal, remaining = outcome.tokens, "Request admitted");
        } else {
            debug!(
                principal = %principal,
                remaining = outcome.tokens,
                retry_after = metadata.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(RateLimitDecision {
            allowed: outcome.allowed,
            metadata,
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::ratelimit::{ManualClock, Tier};
    use crate::store::{ConsumeOutcome, InMemoryBucketStore};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn limiter() -> (TokenBucketLimiter, Arc<InMemoryBucketStore>) {
        let store = Arc::new(InMemoryBucketStore::new());
        (TokenBucketLimiter::new(store.clone()), store)
    }

    /// A store whose backend is down.
    struct UnreachableStore;

    #[async_trait]
    impl BucketStore for UnreachableStore {
        async fn refill_and_consume(
            &self,
            _key: &str,
            _request: ConsumeRequest,
        ) -> Result<ConsumeOutcome> {
            Err(GatewayError::StoreUnavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<()> {
            Err(GatewayError::StoreUnavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_allow_request() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(Tier::Free, 60, 10).unwrap();

        let decision = limiter.is_allowed("user_1", &config).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.metadata.remaining.floor(), 9.0);
        assert_eq!(decision.metadata.limit, 10);
    }

    #[tokio::test]
    async fn test_burst_then_deny() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(Tier::Premium, 60, 10).unwrap();

        for expected in (0..10).rev() {
            let decision = limiter.is_allowed("u1", &config).await.unwrap();
            assert!(decision.allowed);
            // Refill between calls is at most a tiny fraction of a token
            assert_eq!(decision.metadata.remaining.floor(), expected as f64);
        }

        let decision = limiter.is_allowed("u1", &config).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.metadata.remaining < 1.0);
        assert!(decision.metadata.retry_after > 0.0);
        assert!(decision.metadata.retry_after <= 1.0);
    }

    #[tokio::test]
    async fn test_burst_remaining_counts_down_exactly() {
        let store = Arc::new(InMemoryBucketStore::new());
        let clock = ManualClock::new(1_700_000_000.0);
        let limiter = TokenBucketLimiter::new(store)
            .with_clock(Arc::new(clock.clone()));
        let config = RateLimitConfig::new(Tier::Premium, 60, 10).unwrap();

        for expected in (0..10).rev() {
            let decision = limiter.is_allowed("u1", &config).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.metadata.remaining, expected as f64);
        }

        let decision = limiter.is_allowed("u1", &config).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.metadata.remaining, 0.0);
        assert_eq!(decision.metadata.retry_after, 1.0);
    }

    #[tokio::test]
    async fn test_refill_with_manual_clock() {
        let store = Arc::new(InMemoryBucketStore::new());
        let clock = ManualClock::new(0.0);
        let limiter = TokenBucketLimiter::new(store)
            .with_clock(Arc::new(clock.clone()));
        // 30 rpm = one token every 2s
        let config = RateLimitConfig::new(Tier::Free, 30, 2).unwrap();

        assert!(limiter.is_allowed("m", &config).await.unwrap().allowed);
        assert!(limiter.is_allowed("m", &config).await.unwrap().allowed);
        assert!(!limiter.is_allowed("m", &config).await.unwrap().allowed);

        clock.advance(1.0);
        let decision = limiter.is_allowed("m", &config).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.metadata.remaining, 0.5);
        assert_eq!(decision.metadata.retry_after, 1.0);

        clock.advance(1.0);
        assert!(limiter.is_allowed("m", &config).await.unwrap().allowed);

        // A long idle period refills only up to the burst size
        clock.advance(3600.0);
        let decision = limiter.is_allowed("m", &config).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.metadata.remaining, 1.0);
    }

    #[tokio::test]
    async fn test_idle_principals_are_dropped_from_store() {
        let store = Arc::new(InMemoryBucketStore::new());
        let clock = ManualClock::new(1_700_000_000.0);
        let limiter = TokenBucketLimiter::new(store.clone())
            .with_clock(Arc::new(clock.clone()));
        // Bucket TTL is 2s
        let config = RateLimitConfig::new(Tier::Free, 60, 1).unwrap();

        for n in 0..1000 {
            let decision = limiter.is_allowed(&format!("idle-{}", n), &config).await;
            assert!(decision.unwrap().allowed);
        }
        assert_eq!(store.len(), 1000);

        clock.advance(3600.0);
        assert!(limiter.is_allowed("active", &config).await.unwrap().allowed);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_exactly_capacity_requests_allowed() {
        let (limiter, _) = limiter();

        for (rpm, burst) in [(1, 1), (6, 3), (60, 7), (120, 25)] {
            let config = RateLimitConfig::new(Tier::Basic, rpm, burst).unwrap();
            let principal = format!("cap-{}-{}", rpm, burst);

            for _ in 0..burst {
                let decision = limiter.is_allowed(&principal, &config).await;
                assert!(decision.unwrap().allowed);
            }
            let decision = limiter.is_allowed(&principal, &config).await;
            assert!(!decision.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_block_single_token_bucket() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(Tier::Free, 60, 1).unwrap();

        assert!(limiter.is_allowed("user_2", &config).await.unwrap().allowed);

        let decision = limiter.is_allowed("user_2", &config).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.metadata.remaining < 0.1);
    }

    #[tokio::test]
    async fn test_refill_after_wait() {
        let (limiter, _) = limiter();
        // 600 rpm = 1 token every 0.1s
        let config = RateLimitConfig::new(Tier::Basic, 600, 1).unwrap();

        assert!(limiter.is_allowed("user_3", &config).await.unwrap().allowed);
        assert!(!limiter.is_allowed("user_3", &config).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(limiter.is_allowed("user_3", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_principals_are_independent() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(Tier::Free, 60, 1).unwrap();

        assert!(limiter.is_allowed("a", &config).await.unwrap().allowed);
        assert!(!limiter.is_allowed("a", &config).await.unwrap().allowed);
        assert!(limiter.is_allowed("b", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_consume_token_spends_quota() {
        let (limiter, store) = limiter();
        let config = RateLimitConfig::new(Tier::Free, 60, 2).unwrap();

        assert_ok!(limiter.consume_token("c", &config).await);
        assert_ok!(limiter.consume_token("c", &config).await);
        assert!(!limiter.is_allowed("c", &config).await.unwrap().allowed);

        let state = store.get("rate_limit:c", SystemClock.now_secs()).unwrap();
        assert!(state.tokens < 1.0);
    }

    #[tokio::test]
    async fn test_tokens_stay_within_bounds() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(Tier::Enterprise, 6000, 5).unwrap();

        for _ in 0..50 {
            let decision = limiter.is_allowed("bounds", &config).await.unwrap();
            assert!(decision.metadata.remaining >= 0.0);
            assert!(decision.metadata.remaining <= 5.0);
        }
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_exactly_burst() {
        let (limiter, _) = limiter();
        let limiter = Arc::new(limiter);
        // Slow refill so the test is not timing sensitive
        let config = RateLimitConfig::new(Tier::Free, 1, 10).unwrap();

        let checks = (0..40).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.is_allowed("crowd", &config).await.unwrap() })
        });
        let decisions = futures::future::join_all(checks).await;

        let admitted = decisions
            .into_iter()
            .map(|d| d.unwrap())
            .filter(|d| d.allowed)
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let limiter = TokenBucketLimiter::new(Arc::new(UnreachableStore));
        let config = RateLimitConfig::new(Tier::Free, 60, 10).unwrap();

        let err = limiter.is_allowed("u", &config).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_err!(limiter.consume_token("u", &config).await);
        assert_err!(limiter.health_check().await);
    }

    #[test]
    fn test_bucket_key() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.bucket_key("abc"), "rate_limit:abc");

        let store = Arc::new(InMemoryBucketStore::new());
        let limiter = TokenBucketLimiter::with_prefix(store, "edge:rl");
        assert_eq!(limiter.bucket_key("abc"), "edge:rl:abc");
    }
}
