//! Response cache with TTL expiry and hit/miss accounting.
//!
//! Two backends: an in-process LRU (local to one gateway instance) and a
//! Redis backend shared by every instance pointed at the same server. No
//! cross-instance coherence is attempted for the in-process cache; a miss on
//! one instance that would hit on another only costs an extra forward.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use memory::InMemoryCache;
pub use self::redis::RedisCache;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently stored.
    pub size: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            None
        } else {
            Some(self.hits as f64 / lookups as f64)
        }
    }
}

/// Storage for previously computed response payloads.
///
/// Values are structured JSON; a `set` fully replaces any previous entry for
/// the key. Expired entries are never returned, and a lookup that finds
/// nothing live counts as a miss.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Return the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, expiring `ttl` from now.
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;

    /// Remove `key`. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Best-effort snapshot of the counters; never blocks writers.
    async fn get_stats(&self) -> Result<CacheStats>;

    /// Check that the cache backend is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
