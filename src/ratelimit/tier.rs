//! Service tiers and per-principal token bucket parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Bucket expiry used when the refill rate is zero and the bucket never refills.
const FALLBACK_BUCKET_TTL_SECS: u64 = 3600;

/// Service tier of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token bucket parameters for one principal.
///
/// Both numeric fields are guaranteed positive: the only way to build one is
/// through [`RateLimitConfig::new`], which rejects zero values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitConfig {
    tier: Tier,
    requests_per_minute: u32,
    burst_size: u32,
}

impl RateLimitConfig {
    /// Create a validated configuration.
    pub fn new(tier: Tier, requests_per_minute: u32, burst_size: u32) -> Result<Self> {
        if requests_per_minute == 0 {
            return Err(GatewayError::InvalidConfig(format!(
                "requests_per_minute must be positive for tier {}",
                tier
            )));
        }
        if burst_size == 0 {
            return Err(GatewayError::InvalidConfig(format!(
                "burst_size must be positive for tier {}",
                tier
            )));
        }

        Ok(Self {
            tier,
            requests_per_minute,
            burst_size,
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Bucket capacity.
    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    /// How long an untouched bucket is kept in the store.
    ///
    /// Twice the time an empty bucket needs to refill completely, never less
    /// than one second.
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(bucket_ttl_secs(f64::from(self.burst_size), self.refill_rate()))
    }

    /// Seconds until at least one token is available, given `remaining` tokens.
    pub fn retry_after(&self, remaining: f64) -> f64 {
        retry_after_secs(remaining, self.refill_rate())
    }
}

impl<'de> Deserialize<'de> for RateLimitConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            tier: Tier,
            requests_per_minute: u32,
            burst_size: u32,
        }

        let raw = Raw::deserialize(deserializer)?;
        RateLimitConfig::new(raw.tier, raw.requests_per_minute, raw.burst_size)
            .map_err(serde::de::Error::custom)
    }
}

/// Expiry for a bucket of `capacity` tokens refilling at `rate` tokens/sec.
pub fn bucket_ttl_secs(capacity: f64, rate: f64) -> u64 {
    if rate <= 0.0 {
        return FALLBACK_BUCKET_TTL_SECS;
    }
    let ttl = (2.0 * capacity / rate).ceil();
    (ttl as u64).max(1)
}

/// Seconds until one token is available with `remaining` tokens at `rate` tokens/sec.
pub fn retry_after_secs(remaining: f64, rate: f64) -> f64 {
    if rate <= 0.0 {
        return FALLBACK_BUCKET_TTL_SECS as f64;
    }
    ((1.0 - remaining) / rate).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_values() {
        let err = RateLimitConfig::new(Tier::Free, 0, 10).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));

        let err = RateLimitConfig::new(Tier::Free, 60, 0).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_refill_rate() {
        let config = RateLimitConfig::new(Tier::Basic, 600, 1).unwrap();
        assert!((config.refill_rate() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bucket_ttl_is_twice_full_refill() {
        // 10 tokens at 1 token/sec refill fully in 10s
        let config = RateLimitConfig::new(Tier::Premium, 60, 10).unwrap();
        assert_eq!(config.bucket_ttl(), Duration::from_secs(20));
    }

    #[test]
    fn test_bucket_ttl_has_one_second_floor() {
        // 1 token at 100 tokens/sec refills in 10ms
        let config = RateLimitConfig::new(Tier::Enterprise, 6000, 1).unwrap();
        assert_eq!(config.bucket_ttl(), Duration::from_secs(1));
        assert_eq!(bucket_ttl_secs(5.0, 0.0), 3600);
    }

    #[test]
    fn test_retry_after() {
        let config = RateLimitConfig::new(Tier::Free, 60, 10).unwrap();
        assert!((config.retry_after(0.0) - 1.0).abs() < 1e-9);
        assert!((config.retry_after(0.5) - 0.5).abs() < 1e-9);
        assert_eq!(config.retry_after(3.0), 0.0);
    }

    #[test]
    fn test_deserialize_validates() {
        let yaml = "tier: premium\nrequests_per_minute: 60\nburst_size: 10\n";
        let config: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tier(), Tier::Premium);
        assert_eq!(config.burst_size(), 10);

        let yaml = "tier: free\nrequests_per_minute: 0\nburst_size: 10\n";
        assert!(serde_yaml::from_str::<RateLimitConfig>(yaml).is_err());
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Enterprise.to_string(), "enterprise");
        assert_eq!(Tier::ALL.len(), 4);
    }
}
