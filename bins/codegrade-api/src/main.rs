mod client;
mod config;
mod error;
mod handlers;
mod health;
mod metrics;
mod rate_limit;
mod routes;
mod safety;

use anyhow::Context;
use axum::Router;
use client::{ExecutionBackend, HttpExecutorClient};
use config::{GatewayConfig, StoreKind};
use health::HealthReporter;
use rate_limit::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore};
use redis::aio::ConnectionManager;
use safety::SafetyPolicy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub struct AppState {
    pub config: GatewayConfig,
    pub safety: SafetyPolicy,
    pub limiter: RateLimiter,
    /// `None` when EXECUTOR_URL or EXECUTOR_TOKEN is missing
    pub backend: Option<Arc<dyn ExecutionBackend>>,
    pub health: Arc<HealthReporter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Codegrade gateway booting...");

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    metrics::register();

    let safety = SafetyPolicy::java_default().context("invalid safety policy")?;
    info!(rules = safety.rules().len(), "Safety policy loaded");

    let store: Arc<dyn CounterStore> = match config.store {
        StoreKind::Redis => {
            let client = redis::Client::open(config.redis_url.as_str())
                .context("Failed to create Redis client")?;
            let conn = ConnectionManager::new(client)
                .await
                .context("Failed to connect to Redis")?;
            info!("Connected to Redis: {}", config.redis_url);
            Arc::new(RedisCounterStore::new(conn))
        }
        StoreKind::Memory => {
            warn!("Using process-local rate limit counters; limits are per instance");
            Arc::new(MemoryCounterStore::new())
        }
    };
    info!(store = store.name(), timeout_ms = config.store_timeout.as_millis() as u64, "Rate limiter ready");
    let limiter = RateLimiter::new(store, config.store_timeout);

    let backend: Option<Arc<dyn ExecutionBackend>> = match config.executor() {
        Some((url, token)) => {
            info!(executor_url = url, "Executor configured");
            Some(Arc::new(
                HttpExecutorClient::new(url, token, config.executor_request_timeout)
                    .context("Failed to build executor client")?,
            ))
        }
        None => {
            warn!("EXECUTOR_URL or EXECUTOR_TOKEN missing; execute endpoints will answer 503");
            None
        }
    };

    let health = Arc::new(
        HealthReporter::new(
            config.executor_url.clone(),
            config.executor_token.clone(),
            config.health_probe_timeout,
        )
        .context("Failed to build health probe client")?,
    );
    if let Some(interval) = config.health_probe_interval {
        health.spawn_refresher(interval);
    }

    let addr = config.bind_addr.clone();
    let state = Arc::new(AppState {
        config,
        safety,
        limiter,
        backend,
        health,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Gateway shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal");
}
