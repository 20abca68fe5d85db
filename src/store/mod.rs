//! Shared state store boundary for token buckets.
//!
//! The limiter never reads and then writes a bucket in two steps: it hands
//! the whole refill-and-consume to the store as one atomic primitive. Any
//! number of gateway processes may share a store.

mod memory;
mod redis;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::InMemoryBucketStore;
pub use self::redis::RedisBucketStore;

/// Parameters of one atomic refill-and-consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeRequest {
    /// Bucket capacity (burst size).
    pub capacity: f64,
    /// Refill rate in tokens per second.
    pub refill_rate: f64,
    /// Current UNIX time in fractional seconds.
    pub now: f64,
    /// Tokens to take.
    pub requested: f64,
    /// Expiry to set on the bucket key after the update.
    pub ttl_secs: u64,
}

/// Result of the atomic primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Tokens left after the (possible) consumption.
    pub tokens: f64,
}

/// An atomic "read-modify-write-with-expiry" over a single bucket key.
///
/// Implementations must guarantee that concurrent calls for the same key are
/// serialized; a bucket is created full when the key is absent or expired.
/// Failure to execute must surface as [`GatewayError::StoreUnavailable`].
///
/// [`GatewayError::StoreUnavailable`]: crate::error::GatewayError::StoreUnavailable
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill the bucket at `key`, consume if possible, persist, refresh expiry.
    async fn refill_and_consume(
        &self,
        key: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;
}
