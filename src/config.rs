//! Configuration management for the gateway.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::ratelimit::{RateLimitConfig, Tier, DEFAULT_KEY_PREFIX};

/// Prefix of environment variables overriding file configuration,
/// e.g. `TURNSTILE__CACHE__TTL_SECS=30`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Downstream call configuration
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared state store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one the limiter keeps buckets in process memory
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix of bucket keys
    #[serde(default = "default_bucket_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_bucket_prefix(),
        }
    }
}

fn default_bucket_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// What the pipeline does when the limiter's store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Reject the request with a store-unavailable error
    #[default]
    Closed,
    /// Let the request through without rate limit metadata
    Open,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Behaviour on store failure
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Bucket parameters per tier
    #[serde(default)]
    pub tiers: TierTable,

    /// Known API keys and their tiers
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,

    /// Tier for keys not listed in `api_keys`; unknown keys are rejected without one
    #[serde(default)]
    pub default_tier: Option<Tier>,
}

/// An API key and its tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub tier: Tier,
}

/// Raw bucket parameters of one tier, validated into a [`RateLimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

/// Limits of every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_free")]
    pub free: TierLimits,
    #[serde(default = "default_basic")]
    pub basic: TierLimits,
    #[serde(default = "default_premium")]
    pub premium: TierLimits,
    #[serde(default = "default_enterprise")]
    pub enterprise: TierLimits,
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Basic => &self.basic,
            Tier::Premium => &self.premium,
            Tier::Enterprise => &self.enterprise,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: default_free(),
            basic: default_basic(),
            premium: default_premium(),
            enterprise: default_enterprise(),
        }
    }
}

fn default_free() -> TierLimits {
    TierLimits {
        requests_per_minute: 10,
        burst_size: 15,
    }
}

fn default_basic() -> TierLimits {
    TierLimits {
        requests_per_minute: 100,
        burst_size: 150,
    }
}

fn default_premium() -> TierLimits {
    TierLimits {
        requests_per_minute: 1000,
        burst_size: 1500,
    }
}

fn default_enterprise() -> TierLimits {
    TierLimits {
        requests_per_minute: 10000,
        burst_size: 15000,
    }
}

/// Which response cache implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process LRU cache, local to each instance
    #[default]
    Memory,
    /// Redis cache shared by all instances (uses `store.redis_url`)
    Redis,
}

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Maximum entries of the in-process cache (0 = unbounded)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// TTL of cached responses in seconds, independent of bucket expiry
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Prefix of Redis cache keys
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            max_entries: default_max_entries(),
            ttl_secs: default_cache_ttl(),
            key_prefix: default_cache_prefix(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_max_entries() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_prefix() -> String {
    "cache".to_string()
}

/// Downstream call configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Upper bound on a single downstream call in milliseconds
    #[serde(default = "default_forward_timeout")]
    pub timeout_ms: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_forward_timeout(),
        }
    }
}

impl ForwardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_forward_timeout() -> u64 {
    5000
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gateway configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load an optional file, then apply `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: GatewayConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            let limits = self.rate_limiting.tiers.get(tier);
            RateLimitConfig::new(tier, limits.requests_per_minute, limits.burst_size)?;
        }

        if self.cache.ttl_secs == 0 {
            return Err(GatewayError::Config("cache.ttl_secs must be positive".to_string()));
        }
        if self.forward.timeout_ms == 0 {
            return Err(GatewayError::Config("forward.timeout_ms must be positive".to_string()));
        }
        if self.cache.backend == CacheBackend::Redis && self.store.redis_url.is_none() {
            return Err(GatewayError::Config(
                "cache.backend = redis requires store.redis_url".to_string(),
            ));
        }

        Ok(())
    }
}
