// Route table for the Codegrade gateway

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/execute", post(handlers::execute))
        .route("/v1/demo/execute", post(handlers::demo_execute))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::scrape_metrics))
}
