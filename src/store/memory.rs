//! In-process bucket store.
//!
//! Local to one gateway instance. Useful for single-node deployments and
//! tests; the dashmap entry guard holds the shard lock for the whole update,
//! which gives the same per-key atomicity the Redis script provides.
//!
//! Expired buckets are swept at most once per [`PURGE_INTERVAL_SECS`], on the
//! next update after the interval has passed, so memory stays bounded by the
//! principals active within the last bucket TTL.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BucketStore, ConsumeOutcome, ConsumeRequest};
use crate::error::Result;
use crate::ratelimit::BucketState;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    /// UNIX time after which the bucket is treated as absent.
    expires_at: f64,
}

/// Minimum spacing between two sweeps of expired buckets.
pub const PURGE_INTERVAL_SECS: f64 = 60.0;

/// Bucket store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: DashMap<String, StoredBucket>,
    /// UNIX time at which the next sweep is due.
    next_purge: Mutex<f64>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a bucket without modifying it. Expired buckets read as absent.
    pub fn get(&self, key: &str, now: f64) -> Option<BucketState> {
        self.buckets
            .get(key)
            .filter(|b| b.expires_at > now)
            .map(|b| b.state)
    }

    /// Drop every bucket whose expiry has passed.
    pub fn purge_expired(&self, now: f64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.expires_at > now);
        before - self.buckets.len()
    }

    /// Number of stored buckets, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Sweep expired buckets if the purge interval has elapsed.
    ///
    /// Must not be called while an entry guard is held: `retain` locks every
    /// shard.
    fn purge_if_due(&self, now: f64) {
        {
            let mut next_purge = self.next_purge.lock();
            if now < *next_purge {
                return;
            }
            *next_purge = now + PURGE_INTERVAL_SECS;
        }

        let purged = self.purge_expired(now);
        if purged > 0 {
            debug!(purged, remaining = self.buckets.len(), "Purged expired buckets");
        }
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn refill_and_consume(
        &self,
        key: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome> {
        self.purge_if_due(request.now);

        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| StoredBucket {
                state: BucketState::full(request.capacity, request.now),
                expires_at: f64::INFINITY,
            });

        if entry.expires_at <= request.now {
            trace!(key = %key, "Bucket expired, starting full");
            entry.state = BucketState::full(request.capacity, request.now);
        }

        let allowed = entry.state.refill_and_consume(
            request.capacity,
            request.refill_rate,
            request.now,
            request.requested,
        );
        entry.expires_at = request.now + request.ttl_secs as f64;

        Ok(ConsumeOutcome {
            allowed,
            tokens: entry.state.tokens,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
