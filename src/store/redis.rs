//! Redis-backed bucket store.
//!
//! The refill-and-consume runs as a server-side Lua script, so the read,
//! the arithmetic and the write happen in one atomic step on the Redis
//! server no matter how many gateway instances call it.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::{debug, info, warn};

use super::{BucketStore, ConsumeOutcome, ConsumeRequest};
use crate::error::{GatewayError, Result};

/// KEYS[1] = bucket key
/// ARGV = capacity, refill rate (tokens/sec), now (unix secs), requested, ttl (secs)
///
/// Returns `{allowed, tokens}`; tokens travel as a string because Redis
/// truncates Lua numbers to integers on the way out. Stored and returned
/// numbers use `%.17g`, which round-trips an IEEE double exactly; `tostring`
/// would keep only 14 significant digits, about 0.1ms of a UNIX timestamp.
const REFILL_AND_CONSUME_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local info = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(info[1])
local last_refill = tonumber(info[2])

if not tokens or not last_refill then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.max(0, math.min(capacity, tokens + elapsed * rate))

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

local tokens_text = string.format('%.17g', tokens)
redis.call('HSET', key, 'tokens', tokens_text, 'last_refill', string.format('%.17g', now))
redis.call('EXPIRE', key, ttl)

return {allowed, tokens_text}
"#;

/// Bucket store shared by every gateway instance pointed at the same Redis.
#[derive(Clone)]
pub struct RedisBucketStore {
    conn: MultiplexedConnection,
    script: Script,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore").finish_non_exhaustive()
    }
}

impl RedisBucketStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting bucket store to Redis");

        let client = Client::open(url).map_err(store_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;

        Ok(Self::from_connection(conn))
    }

    /// Use an already established connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            script: Script::new(REFILL_AND_CONSUME_LUA),
        }
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn refill_and_consume(
        &self,
        key: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome> {
        let mut conn = self.conn.clone();

        // EVALSHA, falling back to EVAL when the script is not cached yet
        let (allowed, tokens): (i64, String) = self
            .script
            .key(key)
            .arg(request.capacity)
            .arg(request.refill_rate)
            .arg(request.now)
            .arg(request.requested)
            .arg(request.ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Bucket script failed");
                store_error(e)
            })?;

        let tokens: f64 = tokens.parse().map_err(|_| {
            GatewayError::StoreUnavailable(format!(
                "bucket script returned non-numeric tokens: {}",
                tokens
            ))
        })?;

        debug!(key = %key, allowed = allowed == 1, tokens, "Bucket updated");

        Ok(ConsumeOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

fn store_error(e: redis::RedisError) -> GatewayError {
    GatewayError::StoreUnavailable(e.to_string())
}
