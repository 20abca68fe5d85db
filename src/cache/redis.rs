//! Redis-backed response cache.
//!
//! Entries are JSON text stored with a millisecond expiry, so Redis does the
//! TTL bookkeeping. Hit/miss counters live in a hash next to the entries and
//! are therefore store-wide, shared by every gateway instance.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde_json::Value;
use tracing::{info, warn};

use super::{CacheStats, ResponseCache};
use crate::error::{GatewayError, Result};

/// Keys examined per SCAN round trip when counting entries.
const SCAN_BATCH: usize = 500;

/// Response cache stored in Redis.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    prefix: String,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to Redis at `url`, namespacing every key under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        info!("Connecting response cache to Redis");

        let client = Client::open(url).map_err(cache_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_error)?;

        Ok(Self::from_connection(conn, prefix))
    }

    pub fn from_connection(conn: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:entry:{}", self.prefix, key)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.prefix)
    }

    async fn record_lookup(&self, field: &str) {
        let mut conn = self.conn.clone();
        let counted: redis::RedisResult<i64> = redis::cmd("HINCRBY")
            .arg(self.stats_key())
            .arg(field)
            .arg(1)
            .query_async(&mut conn)
            .await;

        if let Err(e) = counted {
            warn!(field = %field, error = %e, "Failed to update cache counters");
        }
    }

    async fn count_entries(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:entry:*", self.prefix);
        let mut cursor: u64 = 0;
        let mut total: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(cache_error)?;

            total += keys.len() as u64;
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }
}

/// Decode a stored payload. Text that is not JSON comes back as a JSON string.
fn decode(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(key))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        match raw {
            Some(raw) => {
                self.record_lookup("hits").await;
                Ok(Some(decode(raw)))
            }
            None => {
                self.record_lookup("misses").await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.entry_key(key))
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.entry_key(key))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        Ok(())
    }

    async fn get_stats(&self) -> Result<CacheStats> {
        let mut conn = self.conn.clone();
        let (hits, misses): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.stats_key())
            .arg("hits")
            .arg("misses")
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        Ok(CacheStats {
            hits: hits.unwrap_or(0),
            misses: misses.unwrap_or(0),
            size: self.count_entries().await?,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}

fn cache_error(e: redis::RedisError) -> GatewayError {
    GatewayError::Cache(e.to_string())
}
