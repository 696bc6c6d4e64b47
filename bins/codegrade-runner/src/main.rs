mod config;
mod engine;
mod evaluator;
mod executor;
mod sandbox;
mod server;


use anyhow::Context;
use config::RunnerConfig;
use engine::DockerEngine;
use executor::Orchestrator;
use sandbox::Sandbox;
use server::RunnerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Codegrade runner booting...");

    let config = RunnerConfig::from_env().context("invalid runner configuration")?;
    info!(
        image = %config.sandbox.image,
        max_concurrency = config.max_concurrency,
        submission_budget_ms = config.limits.submission_budget_ms,
        "Runner configured"
    );

    let engine = DockerEngine::connect(config.sandbox.clone())?;
    // The daemon may come up after us; /health reports it until then
    match engine.ping().await {
        Ok(()) => info!("Connected to Docker daemon"),
        Err(e) => warn!(error = %e, "Docker daemon not reachable yet"),
    }

    let state = Arc::new(RunnerState::new(
        Orchestrator::new(engine, config.limits.clone()),
        config.token.clone(),
        config.max_concurrency,
        config.queue_timeout,
    ));
    let app = server::router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Runner shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

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
    warn!("Received shutdown signal, draining in-flight submissions...");
}
