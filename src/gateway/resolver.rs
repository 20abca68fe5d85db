//! Principal to tier resolution.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::trace;

use crate::config::RateLimitingConfig;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{RateLimitConfig, Tier};

/// Maps a principal to the bucket parameters that apply to it.
#[async_trait]
pub trait TierResolver: Send + Sync {
    /// Fails with [`GatewayError::PrincipalUnknown`] for unrecognised principals.
    async fn resolve(&self, principal: &str) -> Result<RateLimitConfig>;
}

/// Resolver over a fixed table of API keys, built from configuration.
#[derive(Debug, Clone)]
pub struct StaticTierResolver {
    keys: HashMap<String, Tier>,
    tiers: HashMap<Tier, RateLimitConfig>,
    default_tier: Option<Tier>,
}

impl StaticTierResolver {
    /// Build from the rate limiting section, validating every tier's limits.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let mut tiers = HashMap::new();
        for tier in Tier::ALL {
            let limits = config.tiers.get(tier);
            tiers.insert(
                tier,
                RateLimitConfig::new(tier, limits.requests_per_minute, limits.burst_size)?,
            );
        }

        let keys = config
            .api_keys
            .iter()
            .map(|entry| (entry.key.clone(), entry.tier))
            .collect();

        Ok(Self {
            keys,
            tiers,
            default_tier: config.default_tier,
        })
    }

    /// Register or re-tier a single key.
    pub fn insert_key(&mut self, key: impl Into<String>, tier: Tier) {
        self.keys.insert(key.into(), tier);
    }

    pub fn tier_config(&self, tier: Tier) -> Option<&RateLimitConfig> {
        self.tiers.get(&tier)
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn resolve(&self, principal: &str) -> Result<RateLimitConfig> {
        // A missing key must not fall through to the default tier and share
        // one anonymous bucket.
        if principal.is_empty() {
            return Err(GatewayError::PrincipalUnknown(String::new()));
        }

        let tier = self
            .keys
            .get(principal)
            .copied()
            .or(self.default_tier)
            .ok_or_else(|| GatewayError::PrincipalUnknown(principal.to_string()))?;

        trace!(principal = %principal, tier = %tier, "Resolved tier");

        self.tiers.get(&tier).copied().ok_or_else(|| {
            GatewayError::InvalidConfig(format!("no limits configured for tier {}", tier))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeyEntry, TierLimits};

    fn config() -> RateLimitingConfig {
        let mut config = RateLimitingConfig::default();
        config.api_keys = vec![
            ApiKeyEntry {
                key: "premium_user".to_string(),
                tier: Tier::Premium,
            },
            ApiKeyEntry {
                key: "free_user".to_string(),
                tier: Tier::Free,
            },
        ];
        config
    }

    #[tokio::test]
    async fn test_resolves_known_keys() {
        let resolver = StaticTierResolver::from_config(&config()).unwrap();

        let premium = resolver.resolve("premium_user").await.unwrap();
        assert_eq!(premium.tier(), Tier::Premium);

        let free = resolver.resolve("free_user").await.unwrap();
        assert_eq!(free.tier(), Tier::Free);
        assert!(free.burst_size() < premium.burst_size());
    }

    #[tokio::test]
    async fn test_unknown_principal() {
        let resolver = StaticTierResolver::from_config(&config()).unwrap();

        let err = resolver.resolve("stranger").await.unwrap_err();
        assert!(matches!(err, GatewayError::PrincipalUnknown(p) if p == "stranger"));
    }

    #[tokio::test]
    async fn test_default_tier_applies_to_unknown_keys() {
        let mut config = config();
        config.default_tier = Some(Tier::Basic);
        let mut resolver = StaticTierResolver::from_config(&config).unwrap();

        assert_eq!(resolver.resolve("stranger").await.unwrap().tier(), Tier::Basic);

        resolver.insert_key("stranger", Tier::Enterprise);
        assert_eq!(resolver.resolve("stranger").await.unwrap().tier(), Tier::Enterprise);
    }

    #[tokio::test]
    async fn test_empty_principal_rejected_even_with_default_tier() {
        let mut config = config();
        config.default_tier = Some(Tier::Free);
        let resolver = StaticTierResolver::from_config(&config).unwrap();

        let err = resolver.resolve("").await.unwrap_err();
        assert!(matches!(err, GatewayError::PrincipalUnknown(_)));
        assert_eq!(resolver.resolve("anyone").await.unwrap().tier(), Tier::Free);
    }

    #[test]
    fn test_invalid_tier_limits_rejected() {
        let mut config = config();
        config.tiers.basic = TierLimits {
            requests_per_minute: 0,
            burst_size: 5,
        };

        let err = StaticTierResolver::from_config(&config).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }
}
