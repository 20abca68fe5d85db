//! Admission pipeline.
//!
//! One linear state machine per request:
//!
//! ```text
//! RESOLVE_TIER -> CHECK_LIMIT -> { DENIED | CHECK_CACHE }
//! CHECK_CACHE  -> { CACHE_HIT | CACHE_MISS }
//! CACHE_MISS   -> FORWARD -> FILL_CACHE (cacheable, 200 only) -> DONE
//! ```
//!
//! The token is spent in CHECK_LIMIT whatever happens afterwards: a cache
//! hit, a failed forward and a timed-out forward all cost one unit of quota.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::forward::{ForwardRequest, ForwardResponse, Forwarder};
use super::request::InboundRequest;
use super::resolver::TierResolver;
use crate::cache::{CacheStats, ResponseCache};
use crate::config::{FailurePolicy, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::ratelimit::{RateLimitMetadata, RateLimiter};

/// Where a served payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Cache,
    Upstream,
}

/// A request that was let through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedResponse {
    pub source: ResponseSource,
    pub status: u16,
    pub payload: Value,
    /// `None` only when the limiter's store failed under [`FailurePolicy::Open`].
    pub rate_limit: Option<RateLimitMetadata>,
}

/// Gateway-visible outcome of one request.
///
/// Store failures under [`FailurePolicy::Closed`] are not an `Admission` at
/// all but a [`GatewayError::StoreUnavailable`], so "over quota" and
/// "infrastructure down" can never be confused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Admission {
    Denied(RateLimitMetadata),
    Served(ServedResponse),
}

impl Admission {
    pub fn allowed(&self) -> bool {
        matches!(self, Admission::Served(_))
    }

    pub fn rate_limit(&self) -> Option<&RateLimitMetadata> {
        match self {
            Admission::Denied(metadata) => Some(metadata),
            Admission::Served(served) => served.rate_limit.as_ref(),
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            Admission::Denied(_) => None,
            Admission::Served(served) => Some(served.source),
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Admission::Denied(_) => None,
            Admission::Served(served) => Some(&served.payload),
        }
    }
}

/// Knobs of the pipeline itself, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// TTL of filled cache entries, independent of bucket expiry.
    pub cache_ttl: Duration,
    /// Upper bound on one downstream call.
    pub forward_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for PipelineSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            cache_ttl: config.cache.ttl(),
            forward_timeout: config.forward.timeout(),
            failure_policy: config.rate_limiting.failure_policy,
        }
    }
}

/// Health of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<()>> for ComponentHealth {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                healthy: true,
                error: None,
            },
            Err(e) => Self {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Overall gateway health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// `ok` when every dependency is healthy, `degraded` otherwise.
    pub status: &'static str,
    pub rate_limiter: ComponentHealth,
    pub cache: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_stats: Option<CacheStats>,
}

/// The admission pipeline, wired to its collaborators.
pub struct Gateway {
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<dyn ResponseCache>,
    resolver: Arc<dyn TierResolver>,
    forwarder: Arc<dyn Forwarder>,
    settings: PipelineSettings,
}

impl Gateway {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        cache: Arc<dyn ResponseCache>,
        resolver: Arc<dyn TierResolver>,
        forwarder: Arc<dyn Forwarder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            limiter,
            cache,
            resolver,
            forwarder,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one request through the pipeline.
    ///
    /// Errors: `PrincipalUnknown` from the resolver, `StoreUnavailable` when
    /// the limiter fails under a closed policy, `ForwardTimeout` /
    /// `ForwardConnection` when the downstream call fails. A denial is not an
    /// error.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %request.id,
            principal = %request.principal,
            method = %request.method,
            path = %request.path
        )
    )]
    pub async fn handle(&self, request: InboundRequest) -> Result<Admission> {
        let config = self.resolver.resolve(&request.principal).await?;

        let rate_limit = match self.limiter.is_allowed(&request.principal, &config).await {
            Ok(decision) if decision.allowed => Some(decision.metadata),
            Ok(decision) => {
                info!(
                    remaining = decision.metadata.remaining,
                    retry_after = decision.metadata.retry_after,
                    "Request denied by rate limit"
                );
                return Ok(Admission::Denied(decision.metadata));
            }
            Err(e)
                if e.is_store_unavailable()
                    && self.settings.failure_policy == FailurePolicy::Open =>
            {
                warn!(error = %e, "Rate limiter unavailable, admitting request (fail-open)");
                None
            }
            Err(e) => {
                warn!(error = %e, "Rate limit check failed");
                return Err(e);
            }
        };

        let cacheable = request.method.is_cacheable();
        let cache_key = request.fingerprint().to_key();

        if cacheable {
            if let Some(payload) = self.lookup(&cache_key).await {
                debug!(key = %cache_key, "Serving from cache");
                return Ok(Admission::Served(ServedResponse {
                    source: ResponseSource::Cache,
                    status: 200,
                    payload,
                    rate_limit,
                }));
            }
        }

        let forward_request = ForwardRequest {
            path: request.path,
            method: request.method,
            body: request.body,
            tier: config.tier(),
        };
        let response = self.forward(&forward_request).await?;

        // Cache hits are served as 200, so only a 200 may be stored
        if cacheable && response.status == 200 {
            self.fill(&cache_key, &response.payload).await;
        }

        Ok(Admission::Served(ServedResponse {
            source: ResponseSource::Upstream,
            status: response.status,
            payload: response.payload,
            rate_limit,
        }))
    }

    /// Report the health of the limiter store and the cache.
    pub async fn health(&self) -> HealthReport {
        let rate_limiter = ComponentHealth::from(self.limiter.health_check().await);
        let cache = ComponentHealth::from(self.cache.health_check().await);

        let cache_stats = match self.cache.get_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Failed to read cache statistics");
                None
            }
        };

        let status = if rate_limiter.healthy && cache.healthy {
            "ok"
        } else {
            "degraded"
        };

        HealthReport {
            status,
            rate_limiter,
            cache,
            cache_stats,
        }
    }

    /// Cache read; a failing cache behaves like a miss.
    async fn lookup(&self, key: &str) -> Option<Value> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Cache write; failure only costs a future hit.
    async fn fill(&self, key: &str, payload: &Value) {
        if let Err(e) = self.cache.set(key, payload, self.settings.cache_ttl).await {
            warn!(key = %key, error = %e, "Cache fill failed");
        }
    }

    async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse> {
        let timeout = self.settings.forward_timeout;

        let call = self.forwarder.forward(request, timeout);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ForwardTimeout(timeout)),
        };

        if let Err(ref e) = result {
            warn!(error = %e, "Forward failed");
        }
        result
    }
}
