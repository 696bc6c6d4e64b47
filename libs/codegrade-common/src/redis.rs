use redis::{aio::ConnectionManager, RedisResult, Script};

/// Redis key semantics for rate limiting.
/// Every gateway instance must derive the same key for the same identity,
/// so the scheme lives here rather than in the gateway.

pub const RATE_LIMIT_PREFIX: &str = "codegrade:ratelimit";

/// Atomic fixed-window increment.
///
/// INCR and the expiry are applied in one script so two gateways can never
/// interleave a read and a write. A key that somehow lost its TTL gets it
/// back on the next hit instead of living forever.
const WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Generate the counter key for an identity under a named policy
pub fn rate_limit_key(policy: &str, identity: &str) -> String {
    format!("{}:{}:{}", RATE_LIMIT_PREFIX, policy, identity)
}

/// Counter value and time left in the window after one increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub ttl_ms: u64,
}

/// Increment the window counter for `key`, creating it with a TTL of
/// `window_ms` on first use.
pub async fn incr_window(
    conn: &mut ConnectionManager,
    key: &str,
    window_ms: u64,
) -> RedisResult<WindowCount> {
    let (count, ttl): (i64, i64) = Script::new(WINDOW_SCRIPT)
        .key(key)
        .arg(window_ms)
        .invoke_async(conn)
        .await?;

    Ok(WindowCount {
        count: count.max(0) as u64,
        ttl_ms: ttl.max(0) as u64,
    })
}

/// Round-trip check used by health reporting
pub async fn ping(conn: &mut ConnectionManager) -> RedisResult<()> {
    let _: String = redis::cmd("PING").query_async(conn).await?;
    Ok(())
}
