/// Health Reporter
///
/// Probes the sandbox backend's `/health` endpoint with a bounded timeout and
/// classifies the answer. Probing never fails: every problem is folded into
/// the report.
///
/// The reporter is created once at service start and owns the start time
/// used for `uptimeMs`.
///
/// With an interval configured, a background task refreshes the executor
/// probe and `/health` serves the cached value instead of probing per call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Ok,
    Fail,
    NotConfigured,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ok,
    Fail,
    NotConfigured,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDetails {
    pub url: Option<String>,
    pub latency_ms: Option<u64>,
    pub http_status: Option<u16>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorProbe {
    pub status: ExecutorStatus,
    pub checked_at: DateTime<Utc>,
    pub details: ProbeDetails,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub app: ComponentStatus,
    pub auth: ComponentStatus,
    pub executor: ExecutorStatus,
    pub store: ComponentStatus,
    pub uptime_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub details: ProbeDetails,
}

pub struct HealthReporter {
    http: reqwest::Client,
    executor_url: Option<String>,
    executor_token: Option<String>,
    started_at: Instant,
    cached: RwLock<Option<ExecutorProbe>>,
}

impl HealthReporter {
    pub fn new(
        executor_url: Option<String>,
        executor_token: Option<String>,
        probe_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(probe_timeout).build()?;
        Ok(Self {
            http,
            executor_url: executor_url.map(|u| u.trim_end_matches('/').to_string()),
            executor_token,
            started_at: Instant::now(),
            cached: RwLock::new(None),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Probe the executor right now.
    pub async fn probe_executor(&self) -> ExecutorProbe {
        let checked_at = Utc::now();
        let (url, token) = match (&self.executor_url, &self.executor_token) {
            (Some(url), Some(token)) => (format!("{}/health", url), token),
            _ => {
                return ExecutorProbe {
                    status: ExecutorStatus::NotConfigured,
                    checked_at,
                    details: ProbeDetails {
                        url: self.executor_url.clone(),
                        ..Default::default()
                    },
                }
            }
        };

        let started = Instant::now();
        let outcome = self.http.get(&url).bearer_auth(token).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, http_status, error_code) = match outcome {
            Ok(response) if response.status().is_success() => {
                (ExecutorStatus::Ok, Some(response.status().as_u16()), None)
            }
            Ok(response) => {
                let code = response.status().as_u16();
                (ExecutorStatus::Fail, Some(code), Some(format!("http_{}", code)))
            }
            Err(e) => (ExecutorStatus::Unreachable, None, Some(classify_error(&e).to_string())),
        };

        if status == ExecutorStatus::Ok {
            debug!(latency_ms, "Executor probe ok");
        } else {
            warn!(?status, ?http_status, ?error_code, latency_ms, "Executor probe failed");
        }

        ExecutorProbe {
            status,
            checked_at,
            details: ProbeDetails {
                url: Some(url),
                latency_ms: Some(latency_ms),
                http_status,
                error_code,
            },
        }
    }

    /// Latest executor probe: the cached one when a refresher is running,
    /// otherwise a fresh probe.
    pub async fn executor(&self) -> ExecutorProbe {
        if let Some(probe) = self.cached.read().await.clone() {
            return probe;
        }
        self.probe_executor().await
    }

    /// Keep the cached probe fresh every `interval`.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let probe = reporter.probe_executor().await;
                *reporter.cached.write().await = Some(probe);
            }
        })
    }

    /// Assemble the full report from the executor probe and the states the
    /// caller knows about.
    pub async fn report(&self, auth: ComponentStatus, store: ComponentStatus) -> HealthReport {
        let probe = self.executor().await;
        let healthy = probe.status == ExecutorStatus::Ok && store == ComponentStatus::Ok;

        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            app: ComponentStatus::Ok,
            auth,
            executor: probe.status,
            store,
            uptime_ms: self.uptime().as_millis() as u64,
            checked_at: probe.checked_at,
            details: probe.details,
        }
    }
}

fn classify_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect_failed"
    } else if err.is_builder() {
        "invalid_url"
    } else {
        "request_failed"
    }
}
