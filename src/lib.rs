//! Turnstile - rate-limited, caching request gateway
//!
//! Every request is resolved to a tier, charged one token from a per-principal
//! token bucket, and then either denied, served from a response cache, or
//! forwarded downstream. Buckets live in a shared store (Redis or process
//! memory) so that any number of gateway instances enforce one quota.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod store;
