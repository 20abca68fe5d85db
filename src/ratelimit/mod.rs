//! Token bucket rate limiting.

mod bucket;
mod clock;
mod limiter;
mod tier;

pub use bucket::BucketState;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{
    RateLimitDecision, RateLimitMetadata, RateLimiter, TokenBucketLimiter, DEFAULT_KEY_PREFIX,
};
pub use tier::{bucket_ttl_secs, retry_after_secs, RateLimitConfig, Tier};
