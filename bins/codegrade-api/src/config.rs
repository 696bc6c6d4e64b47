// Gateway configuration, loaded once at boot from the environment
use anyhow::{bail, Result};
use codegrade_common::config::{env_opt, env_or, env_parse};
use codegrade_common::limits::{DEMO_MAX_SOURCE_CHARS, MAX_SOURCE_CHARS};
use std::time::Duration;

use crate::rate_limit::RatePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub redis_url: String,
    pub store: StoreKind,
    pub executor_url: Option<String>,
    pub executor_token: Option<String>,
    pub api_key: Option<String>,
    pub max_source_chars: usize,
    pub demo_max_source_chars: usize,
    pub execute_policy: RatePolicy,
    pub demo_policy: RatePolicy,
    pub store_timeout: Duration,
    pub health_probe_timeout: Duration,
    pub health_probe_interval: Option<Duration>,
    pub executor_request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store: StoreKind::Redis,
            executor_url: None,
            executor_token: None,
            api_key: None,
            max_source_chars: MAX_SOURCE_CHARS,
            demo_max_source_chars: DEMO_MAX_SOURCE_CHARS,
            execute_policy: RatePolicy::execute_default(),
            demo_policy: RatePolicy::demo_default(),
            store_timeout: Duration::from_millis(500),
            health_probe_timeout: Duration::from_millis(3_000),
            health_probe_interval: None,
            executor_request_timeout: Duration::from_millis(90_000),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let store = match env_or("RATE_LIMIT_STORE", "redis").to_ascii_lowercase().as_str() {
            "redis" => StoreKind::Redis,
            "memory" => StoreKind::Memory,
            other => bail!("RATE_LIMIT_STORE must be redis or memory, got {:?}", other),
        };

        let execute_policy = RatePolicy::new(
            "execute",
            env_parse("RATE_LIMIT_EXECUTE", d.execute_policy.limit)?,
            Duration::from_millis(env_parse(
                "RATE_LIMIT_EXECUTE_WINDOW_MS",
                d.execute_policy.window.as_millis() as u64,
            )?),
        );
        let demo_policy = RatePolicy::new(
            "demo",
            env_parse("RATE_LIMIT_DEMO", d.demo_policy.limit)?,
            Duration::from_millis(env_parse(
                "RATE_LIMIT_DEMO_WINDOW_MS",
                d.demo_policy.window.as_millis() as u64,
            )?),
        );
        for policy in [&execute_policy, &demo_policy] {
            if policy.window.is_zero() {
                bail!("rate limit window for {} must be positive", policy.name);
            }
        }

        let max_source_chars = env_parse("MAX_SOURCE_CHARS", d.max_source_chars)?;
        if max_source_chars > MAX_SOURCE_CHARS {
            bail!("MAX_SOURCE_CHARS may not exceed {}", MAX_SOURCE_CHARS);
        }

        let interval_ms: u64 = env_parse("HEALTH_PROBE_INTERVAL_MS", 0)?;

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", &d.bind_addr),
            redis_url: env_or("REDIS_URL", &d.redis_url),
            store,
            executor_url: env_opt("EXECUTOR_URL"),
            executor_token: env_opt("EXECUTOR_TOKEN"),
            api_key: env_opt("API_KEY"),
            max_source_chars,
            demo_max_source_chars: env_parse("DEMO_MAX_SOURCE_CHARS", d.demo_max_source_chars)?
                .min(max_source_chars),
            execute_policy,
            demo_policy,
            store_timeout: Duration::from_millis(env_parse(
                "RATE_LIMIT_STORE_TIMEOUT_MS",
                d.store_timeout.as_millis() as u64,
            )?),
            health_probe_timeout: Duration::from_millis(env_parse(
                "HEALTH_PROBE_TIMEOUT_MS",
                d.health_probe_timeout.as_millis() as u64,
            )?),
            health_probe_interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            executor_request_timeout: Duration::from_millis(env_parse(
                "EXECUTOR_REQUEST_TIMEOUT_MS",
                d.executor_request_timeout.as_millis() as u64,
            )?),
        })
    }

    /// Both halves of the executor connection, or nothing
    pub fn executor(&self) -> Option<(&str, &str)> {
        match (&self.executor_url, &self.executor_token) {
            (Some(url), Some(token)) => Some((url.as_str(), token.as_str())),
            _ => None,
        }
    }
}
