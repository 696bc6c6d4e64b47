// Runner configuration, loaded once at boot from the environment
use anyhow::{bail, Result};
use codegrade_common::config::{env_opt, env_or, env_parse};
use codegrade_common::types::TestCase;
use std::time::Duration;

use crate::sandbox::RunLimits;

/// Container settings for the Docker backend
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image: String,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub compile_memory_mb: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "eclipse-temurin:21-jdk".to_string(),
            cpu_limit: 1.0,
            pids_limit: 128,
            compile_memory_mb: 768,
        }
    }
}

/// Server-side defaults and ceilings for submission and test limits.
///
/// Caller-supplied overrides are never trusted as-is: `clamp` bounds every
/// override to `[min, max]` before it reaches the sandbox.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    pub default_time_limit_ms: u64,
    pub min_time_limit_ms: u64,
    pub max_time_limit_ms: u64,
    pub default_memory_limit_mb: u64,
    pub min_memory_limit_mb: u64,
    pub max_memory_limit_mb: u64,
    pub compile_timeout_ms: u64,
    pub submission_budget_ms: u64,
    pub output_limit_bytes: usize,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            default_time_limit_ms: 2_000,
            min_time_limit_ms: 100,
            max_time_limit_ms: 10_000,
            default_memory_limit_mb: 256,
            min_memory_limit_mb: 32,
            max_memory_limit_mb: 512,
            compile_timeout_ms: 15_000,
            submission_budget_ms: 60_000,
            output_limit_bytes: 64 * 1024,
        }
    }
}

impl LimitPolicy {
    /// Effective limits for one test, given what is left of the submission budget.
    pub fn clamp(&self, test_case: &TestCase, remaining: Duration) -> RunLimits {
        let time_ms = test_case
            .time_limit_ms
            .unwrap_or(self.default_time_limit_ms)
            .clamp(self.min_time_limit_ms, self.max_time_limit_ms);
        let memory_mb = test_case
            .memory_limit_mb
            .unwrap_or(self.default_memory_limit_mb)
            .clamp(self.min_memory_limit_mb, self.max_memory_limit_mb);

        RunLimits {
            timeout: Duration::from_millis(time_ms).min(remaining),
            memory_mb,
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    pub fn submission_budget(&self) -> Duration {
        Duration::from_millis(self.submission_budget_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    fn check(&self) -> Result<()> {
        if self.min_time_limit_ms > self.max_time_limit_ms {
            bail!("MAX_TIME_LIMIT_MS must be at least {}", self.min_time_limit_ms);
        }
        if self.min_memory_limit_mb > self.max_memory_limit_mb {
            bail!("MAX_MEMORY_LIMIT_MB must be at least {}", self.min_memory_limit_mb);
        }
        if self.output_limit_bytes == 0 {
            bail!("OUTPUT_LIMIT_BYTES must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub bind_addr: String,
    pub token: String,
    pub sandbox: SandboxSettings,
    pub limits: LimitPolicy,
    pub max_concurrency: usize,
    pub queue_timeout: Duration,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        let token = match env_opt("RUNNER_TOKEN") {
            Some(token) => token,
            None => bail!("RUNNER_TOKEN must be set; the runner never accepts unauthenticated work"),
        };

        let sandbox_defaults = SandboxSettings::default();
        let sandbox = SandboxSettings {
            image: env_or("SANDBOX_IMAGE", &sandbox_defaults.image),
            cpu_limit: env_parse("SANDBOX_CPU_LIMIT", sandbox_defaults.cpu_limit)?,
            pids_limit: env_parse("SANDBOX_PIDS_LIMIT", sandbox_defaults.pids_limit)?,
            compile_memory_mb: env_parse("COMPILE_MEMORY_MB", sandbox_defaults.compile_memory_mb)?,
        };

        let d = LimitPolicy::default();
        let limits = LimitPolicy {
            default_time_limit_ms: env_parse("DEFAULT_TIME_LIMIT_MS", d.default_time_limit_ms)?,
            min_time_limit_ms: d.min_time_limit_ms,
            max_time_limit_ms: env_parse("MAX_TIME_LIMIT_MS", d.max_time_limit_ms)?,
            default_memory_limit_mb: env_parse("DEFAULT_MEMORY_LIMIT_MB", d.default_memory_limit_mb)?,
            min_memory_limit_mb: d.min_memory_limit_mb,
            max_memory_limit_mb: env_parse("MAX_MEMORY_LIMIT_MB", d.max_memory_limit_mb)?,
            compile_timeout_ms: env_parse("COMPILE_TIMEOUT_MS", d.compile_timeout_ms)?,
            submission_budget_ms: env_parse("SUBMISSION_BUDGET_MS", d.submission_budget_ms)?,
            output_limit_bytes: env_parse("OUTPUT_LIMIT_BYTES", d.output_limit_bytes)?,
        };
        limits.check()?;

        let host_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8081"),
            token,
            sandbox,
            limits,
            max_concurrency: env_parse("RUNNER_MAX_CONCURRENCY", host_parallelism)?.max(1),
            queue_timeout: Duration::from_millis(env_parse("RUNNER_QUEUE_TIMEOUT_MS", 10_000u64)?),
        })
    }
}
