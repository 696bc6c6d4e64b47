// HTTP route handlers for the Codegrade gateway

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use codegrade_common::limits::validate_submission;
use codegrade_common::types::{ExecutionRequest, ExecutionResult, TestCase};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::health::ComponentStatus;
use crate::metrics;
use crate::rate_limit::{Decision, RatePolicy};
use crate::AppState;

const USER_ID_HEADER: &str = "x-user-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub run_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoBody {
    pub source_code: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_ms: u64,
}

impl From<&Decision> for RateLimitInfo {
    fn from(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_ms: decision.reset_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_only: Option<bool>,
    pub rate_limit: RateLimitInfo,
}

pub fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    let values = [
        ("x-ratelimit-limit", decision.limit),
        ("x-ratelimit-remaining", decision.remaining),
        ("x-ratelimit-reset", decision.reset_ms),
    ];
    for (name, value) in values {
        headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
    }
}

/// Checks the caller's `Authorization: Bearer <API_KEY>` when a key is configured
fn authorize_caller(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::Unauthorized("missing or invalid API key")),
    }
}

fn user_identity(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized("missing X-User-Id"))
}

/// First `X-Forwarded-For` hop, else the peer address
fn anonymous_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Everything between a parsed body and a graded result: size caps, safety
/// gate, rate limiter, then the executor.
async fn grade(
    state: &AppState,
    endpoint: &'static str,
    policy: &RatePolicy,
    identity: &str,
    request: ExecutionRequest,
    max_source_chars: usize,
) -> Result<(ExecutionResult, Decision), ApiError> {
    validate_submission(&request.source_code, &request.test_cases, max_source_chars)?;

    let check = state.safety.check(&request.source_code);
    if !check.safe {
        let rule = check.rule.unwrap_or_default();
        let reason = check.reason.unwrap_or_default();
        warn!(request_id = %request.request_id, identity, rule = %rule, "Submission rejected by safety gate");
        metrics::SAFETY_REJECTIONS.with_label_values(&[rule.as_str()]).inc();
        return Err(ApiError::SecurityRejection { rule, reason });
    }

    let backend = state.backend.as_ref().ok_or(ApiError::ExecutorNotConfigured)?;

    let decision = state.limiter.check(policy, identity).await?;
    if !decision.allowed {
        info!(identity, policy = %policy.name, reset_ms = decision.reset_ms, "Rate limit exceeded");
        metrics::RATE_LIMITED.with_label_values(&[policy.name.as_str()]).inc();
        return Err(ApiError::RateLimited {
            policy: policy.name.clone(),
            decision,
        });
    }

    let started = Instant::now();
    let outcome = backend.execute(&request).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(result) => {
            metrics::EXECUTOR_LATENCY
                .with_label_values(&["ok"])
                .observe(elapsed.as_secs_f64());
            metrics::SUBMISSIONS
                .with_label_values(&[endpoint, result.status.as_str()])
                .inc();
            info!(
                request_id = %request.request_id,
                identity,
                status = %result.status,
                execution_ms = result.execution_ms,
                "Submission graded"
            );
            Ok((result, decision))
        }
        Err(e) => {
            metrics::EXECUTOR_LATENCY
                .with_label_values(&["error"])
                .observe(elapsed.as_secs_f64());
            error!(request_id = %request.request_id, error = %e, "Executor call failed");
            Err(e.into())
        }
    }
}

fn graded_response(result: ExecutionResult, run_only: Option<bool>, decision: &Decision) -> Response {
    let mut response = Json(ExecuteResponse {
        result,
        run_only,
        rate_limit: decision.into(),
    })
    .into_response();
    insert_rate_limit_headers(response.headers_mut(), decision);
    response
}

/// POST /v1/execute - Grade a submission for an authenticated user
#[tracing::instrument(skip_all)]
pub async fn execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    authorize_caller(&state, &headers)?;
    let identity = user_identity(&headers)?;
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let request = ExecutionRequest::new(body.source_code, body.test_cases);
    let (result, decision) = grade(
        &state,
        "execute",
        &state.config.execute_policy,
        &identity,
        request,
        state.config.max_source_chars,
    )
    .await?;

    Ok(graded_response(result, Some(body.run_only), &decision))
}

/// POST /v1/demo/execute - Run a snippet anonymously, without assertions
#[tracing::instrument(skip_all)]
pub async fn demo_execute(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<DemoBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    authorize_caller(&state, &headers)?;
    let identity = anonymous_identity(&headers, peer.map(|ConnectInfo(addr)| addr));
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let request = ExecutionRequest::new(body.source_code, vec![TestCase::capture_only()]);
    let (result, decision) = grade(
        &state,
        "demo",
        &state.config.demo_policy,
        &identity,
        request,
        state.config.demo_max_source_chars,
    )
    .await?;

    Ok(graded_response(result, None, &decision))
}

/// GET /health - Gateway and executor status; always 200
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let auth = if state.config.api_key.is_some() {
        ComponentStatus::Ok
    } else {
        ComponentStatus::NotConfigured
    };
    let store = match state.limiter.ping().await {
        Ok(()) => ComponentStatus::Ok,
        Err(e) => {
            warn!(error = %e, "Rate limit store ping failed");
            ComponentStatus::Fail
        }
    };

    let report = state.health.report(auth, store).await;
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(report),
    )
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn scrape_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
