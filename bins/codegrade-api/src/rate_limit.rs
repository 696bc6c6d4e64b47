// Per-identity admission control backed by an atomic window counter

use async_trait::async_trait;
use codegrade_common::redis::{self as keys, WindowCount};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate limit store error: {0}")]
    Backend(String),

    #[error("rate limit store did not answer within {0}ms")]
    Timeout(u64),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Shared counter store. Implementations must make `incr_window` a single
/// atomic step: increment, start the window on first hit, report time left.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::incr_window(&mut conn, key, window.as_millis() as u64).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::ping(&mut conn).await?)
    }
}

/// Process-local store for tests and single-node development.
/// Counters are not shared between gateway instances.
#[derive(Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| StoreError::Backend("counter map poisoned".into()))?;

        let entry = windows.entry(key.to_string()).or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;

        Ok(WindowCount {
            count: entry.0,
            ttl_ms: entry.1.saturating_duration_since(now).as_millis() as u64,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Named budget: at most `limit` requests per `window`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub name: String,
    pub limit: u64,
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(name: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
        }
    }

    pub fn execute_default() -> Self {
        Self::new("execute", 30, Duration::from_secs(60))
    }

    pub fn demo_default() -> Self {
        Self::new("demo", 5, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_ms: u64,
}

impl Decision {
    /// `Retry-After` value: whole seconds, rounded up
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_ms.div_ceil(1000).max(1)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Count one request for `identity` under `policy`.
    ///
    /// Any store failure, including a slow store, is returned as an error:
    /// callers must refuse the request rather than let it through.
    pub async fn check(&self, policy: &RatePolicy, identity: &str) -> Result<Decision, StoreError> {
        let key = keys::rate_limit_key(&policy.name, identity);

        let window = match tokio::time::timeout(self.timeout, self.store.incr_window(&key, policy.window)).await {
            Ok(Ok(window)) => window,
            Ok(Err(e)) => {
                warn!(policy = %policy.name, error = %e, "Rate limit store failed");
                return Err(e);
            }
            Err(_) => {
                warn!(policy = %policy.name, "Rate limit store timed out");
                return Err(StoreError::Timeout(self.timeout.as_millis() as u64));
            }
        };

        let decision = Decision {
            allowed: window.count <= policy.limit,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(window.count),
            reset_ms: window.ttl_ms,
        };
        debug!(
            policy = %policy.name,
            count = window.count,
            allowed = decision.allowed,
            reset_ms = decision.reset_ms,
            "Rate limit checked"
        );
        Ok(decision)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}
