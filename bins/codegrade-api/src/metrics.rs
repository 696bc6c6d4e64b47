// Prometheus metrics for the gateway, exposed on GET /metrics

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Submissions that reached the executor, by endpoint and verdict
    pub static ref SUBMISSIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("codegrade_submissions_total", "Graded submissions by verdict"),
        &["endpoint", "status"]
    )
    .expect("valid metric definition");

    pub static ref SAFETY_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("codegrade_safety_rejections_total", "Submissions rejected by the safety gate"),
        &["rule"]
    )
    .expect("valid metric definition");

    pub static ref RATE_LIMITED: IntCounterVec = IntCounterVec::new(
        Opts::new("codegrade_rate_limited_total", "Requests rejected by the rate limiter"),
        &["policy"]
    )
    .expect("valid metric definition");

    pub static ref EXECUTOR_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "codegrade_executor_latency_seconds",
            "Round trip to the sandbox backend"
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["outcome"]
    )
    .expect("valid metric definition");
}

/// Register every gateway metric. Safe to call more than once.
pub fn register() {
    let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
        Box::new(SUBMISSIONS.clone()),
        Box::new(SAFETY_REJECTIONS.clone()),
        Box::new(RATE_LIMITED.clone()),
        Box::new(EXECUTOR_LATENCY.clone()),
    ];
    for collector in collectors {
        // AlreadyReg on repeated calls
        let _ = REGISTRY.register(collector);
    }
}

/// Render the registry in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
