//! Token bucket state and the refill-then-consume step.
//!
//! The in-process store applies [`BucketState::refill_and_consume`] under a
//! per-key lock; the Redis store runs the same arithmetic inside a Lua script.
//! Both must agree, so the math lives in one place here and the script mirrors it.

use serde::{Deserialize, Serialize};

/// Persisted state of one principal's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// UNIX time (fractional seconds) of the last refill.
    pub last_refill: f64,
}

impl BucketState {
    /// A full bucket, as created lazily on a principal's first request.
    pub fn full(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since `last_refill`, then try to take
    /// `requested` tokens.
    ///
    /// Returns whether the tokens were taken. The state always ends with
    /// `last_refill = now`. Clock skew that puts `now` before `last_refill`
    /// counts as zero elapsed time.
    pub fn refill_and_consume(
        &mut self,
        capacity: f64,
        rate: f64,
        now: f64,
        requested: f64,
    ) -> bool {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * rate).min(capacity).max(0.0);
        self.last_refill = now;

        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }
}
