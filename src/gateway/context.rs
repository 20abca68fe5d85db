//! Process-wide wiring of stores, cache and resolver.
//!
//! A [`GatewayContext`] owns the long-lived connections. It is created once at
//! startup, handed to every [`Gateway`] it builds, and torn down explicitly.

use std::sync::Arc;

use tracing::info;

use super::forward::Forwarder;
use super::pipeline::{Gateway, PipelineSettings};
use super::resolver::StaticTierResolver;
use crate::cache::{InMemoryCache, RedisCache, ResponseCache};
use crate::config::{CacheBackend, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::ratelimit::{RateLimiter, TokenBucketLimiter};
use crate::store::{BucketStore, InMemoryBucketStore, RedisBucketStore};

pub struct GatewayContext {
    config: GatewayConfig,
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<dyn ResponseCache>,
    resolver: Arc<StaticTierResolver>,
}

impl GatewayContext {
    /// Validate `config` and open every connection it names.
    ///
    /// With `store.redis_url` set, buckets live in Redis and every instance
    /// pointed at the same server shares them; otherwise they are kept in
    /// process memory.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn BucketStore> = match &config.store.redis_url {
            Some(url) => {
                info!(url = %url, "Using Redis bucket store");
                Arc::new(RedisBucketStore::connect(url).await?)
            }
            None => {
                info!("Using in-memory bucket store");
                Arc::new(InMemoryBucketStore::new())
            }
        };
        let limiter = Arc::new(TokenBucketLimiter::with_prefix(
            store,
            config.store.key_prefix.clone(),
        ));

        let cache: Arc<dyn ResponseCache> = match config.cache.backend {
            CacheBackend::Memory => {
                info!(
                    max_entries = config.cache.max_entries,
                    "Using in-memory response cache"
                );
                Arc::new(InMemoryCache::new(config.cache.max_entries))
            }
            CacheBackend::Redis => {
                let url = config.store.redis_url.as_deref().ok_or_else(|| {
                    GatewayError::Config(
                        "cache.backend = redis requires store.redis_url".to_string(),
                    )
                })?;
                let prefix = config.cache.key_prefix.clone();
                info!(prefix = %prefix, "Using Redis response cache");
                Arc::new(RedisCache::connect(url, prefix).await?)
            }
        };

        let resolver = Arc::new(StaticTierResolver::from_config(&config.rate_limiting)?);

        info!(
            api_keys = config.rate_limiting.api_keys.len(),
            failure_policy = ?config.rate_limiting.failure_policy,
            "Gateway context ready"
        );

        Ok(Self {
            config,
            limiter,
            cache,
            resolver,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> Arc<dyn ResponseCache> {
        self.cache.clone()
    }

    /// Build a pipeline over this context's shared components.
    pub fn gateway(&self, forwarder: Arc<dyn Forwarder>) -> Gateway {
        Gateway::new(
            self.limiter.clone(),
            self.cache.clone(),
            self.resolver.clone(),
            forwarder,
            PipelineSettings::from(&self.config),
        )
    }

    /// Release the store and cache connections.
    ///
    /// Gateways built from this context keep their own handles and stay
    /// usable until dropped.
    pub async fn shutdown(self) {
        drop(self.limiter);
        drop(self.cache);
        info!("Gateway context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyEntry;
    use crate::gateway::{EchoForwarder, InboundRequest, Method, ResponseSource};
    use crate::ratelimit::Tier;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.rate_limiting.api_keys = vec![ApiKeyEntry {
            key: "user_free_1".to_string(),
            tier: Tier::Free,
        }];
        config
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let context = GatewayContext::connect(config()).await.unwrap();
        let gateway = context.gateway(Arc::new(EchoForwarder::new()));

        let first = gateway
            .handle(InboundRequest::new("user_free_1", Method::Get, "api/v1/resource"))
            .await
            .unwrap();
        assert_eq!(first.source(), Some(ResponseSource::Upstream));
        assert_eq!(first.rate_limit().unwrap().limit, 15);

        let second = gateway
            .handle(InboundRequest::new("user_free_1", Method::Get, "api/v1/resource"))
            .await
            .unwrap();
        assert_eq!(second.source(), Some(ResponseSource::Cache));

        let stats = context.cache().get_stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);

        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateways_share_buckets() {
        let mut config = config();
        config.rate_limiting.tiers.free.burst_size = 1;
        let context = GatewayContext::connect(config).await.unwrap();

        let a = context.gateway(Arc::new(EchoForwarder::new()));
        let b = context.gateway(Arc::new(EchoForwarder::new()));

        assert!(a
            .handle(InboundRequest::new("user_free_1", Method::Post, "/x"))
            .await
            .unwrap()
            .allowed());
        assert!(!b
            .handle(InboundRequest::new("user_free_1", Method::Post, "/x"))
            .await
            .unwrap()
            .allowed());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mut config = config();
        config.forward.timeout_ms = 0;

        let err = GatewayContext::connect(config).await.err().unwrap();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_unreachable_redis() {
        let mut config = config();
        config.store.redis_url = Some("redis://127.0.0.1:1".to_string());

        let err = GatewayContext::connect(config).await.err().unwrap();
        assert!(err.is_store_unavailable());
    }
}
