//! In-process response cache.
//!
//! Entries expire by TTL, checked on access. When a maximum size is set, the
//! least recently used entry is evicted on insertion once the bound is
//! exceeded, whether or not it has expired. Counters are atomics so that
//! `get_stats` never waits on the entry lock.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use super::{CacheStats, ResponseCache};
use crate::error::Result;

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// LRU-bounded in-memory cache with per-entry TTL.
pub struct InMemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    size: AtomicU64,
}

impl InMemoryCache {
    /// Create a cache holding at most `max_entries` entries.
    ///
    /// A bound of zero means unbounded.
    pub fn new(max_entries: usize) -> Self {
        let entries = match NonZeroUsize::new(max_entries) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };

        Self {
            entries: Mutex::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            size: AtomicU64::new(0),
        }
    }

    /// Create a cache with no size bound; entries leave only by TTL or delete.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Drop every expired entry now instead of waiting for it to be looked up.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }

        self.size.store(entries.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.size.store(0, Ordering::Relaxed);
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let (live, expired) = match entries.get(key) {
            Some(entry) if entry.is_expired(now) => (None, true),
            Some(entry) => (Some(entry.value.clone()), false),
            None => (None, false),
        };

        if expired {
            trace!(key = %key, "Dropping expired cache entry");
            entries.pop(key);
            self.size.store(entries.len() as u64, Ordering::Relaxed);
        }

        if live.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        };

        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.to_string(), entry) {
            if evicted != key {
                trace!(key = %evicted, "Evicted least recently used cache entry");
            }
        }
        self.size.store(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.pop(key);
        self.size.store(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn get_stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        })
    }
}
