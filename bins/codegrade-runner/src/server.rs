// HTTP surface of the runner: POST /v1/execute and GET /health

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use codegrade_common::limits::ValidationError;
use codegrade_common::types::{ErrorBody, ExecutionRequest};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::executor::{ExecuteError, Orchestrator};
use crate::sandbox::{Sandbox, SandboxError};

pub struct RunnerState<S: Sandbox> {
    pub orchestrator: Orchestrator<S>,
    pub token: String,
    /// One permit per submission allowed to run at the same time
    pub slots: Semaphore,
    pub queue_timeout: Duration,
    pub started_at: Instant,
}

impl<S: Sandbox> RunnerState<S> {
    pub fn new(
        orchestrator: Orchestrator<S>,
        token: impl Into<String>,
        max_concurrency: usize,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            token: token.into(),
            slots: Semaphore::new(max_concurrency.max(1)),
            queue_timeout,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("missing or invalid runner token")]
    Unauthorized,

    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("all execution slots are busy")]
    Busy,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl From<ExecuteError> for RunnerError {
    fn from(err: ExecuteError) -> Self {
        match err {
            ExecuteError::Validation(e) => Self::Validation(e),
            ExecuteError::Sandbox(e) => Self::Sandbox(e),
        }
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            RunnerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            RunnerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            RunnerError::Validation(e) => {
                let status = match e {
                    ValidationError::SourceTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, e.code())
            }
            RunnerError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "executor_busy"),
            RunnerError::Sandbox(_) => (StatusCode::SERVICE_UNAVAILABLE, "sandbox_unavailable"),
        };
        (status, Json(ErrorBody::new(code, self.to_string()))).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerHealth {
    pub status: &'static str,
    pub sandbox: String,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router<S: Sandbox>(state: Arc<RunnerState<S>>) -> Router {
    Router::new()
        .route("/v1/execute", post(execute::<S>))
        .route("/health", get(health::<S>))
        .with_state(state)
}

fn authorize(headers: &HeaderMap, token: &str) -> Result<(), RunnerError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(value) if value == token => Ok(()),
        _ => Err(RunnerError::Unauthorized),
    }
}

/// POST /v1/execute - Compile and grade one submission
async fn execute<S: Sandbox>(
    State(state): State<Arc<RunnerState<S>>>,
    headers: HeaderMap,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RunnerError> {
    authorize(&headers, &state.token)?;
    let Json(request) = payload.map_err(|e| RunnerError::BadRequest(e.body_text()))?;

    let _permit = match tokio::time::timeout(state.queue_timeout, state.slots.acquire()).await {
        Ok(Ok(permit)) => permit,
        _ => {
            warn!(request_id = %request.request_id, "No execution slot freed up in time");
            return Err(RunnerError::Busy);
        }
    };

    info!(
        request_id = %request.request_id,
        test_count = request.test_cases.len(),
        source_chars = request.source_code.chars().count(),
        "Submission accepted"
    );

    match state.orchestrator.execute(&request).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            error!(request_id = %request.request_id, error = %e, "Submission rejected");
            Err(e.into())
        }
    }
}

/// GET /health - Docker daemon liveness
async fn health<S: Sandbox>(
    State(state): State<Arc<RunnerState<S>>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RunnerError> {
    authorize(&headers, &state.token)?;

    let sandbox = state.orchestrator.sandbox();
    let uptime_ms = state.started_at.elapsed().as_millis() as u64;

    let (status, body) = match sandbox.ping().await {
        Ok(()) => (
            StatusCode::OK,
            RunnerHealth {
                status: "ok",
                sandbox: sandbox.name().to_string(),
                uptime_ms,
                error: None,
            },
        ),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                RunnerHealth {
                    status: "fail",
                    sandbox: sandbox.name().to_string(),
                    uptime_ms,
                    error: Some(e.to_string()),
                },
            )
        }
    };
    Ok((status, Json(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitPolicy;
    use crate::sandbox::{CompileOutcome, CompiledArtifact, Deadline, RunLimits, RunOutput};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use codegrade_common::types::{ExecutionResult, ExecutionStatus, TestCase};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;
    use uuid::Uuid;

    const TOKEN: &str = "runner-secret";

    /// Prints its input back; `hold` parks every run until released.
    #[derive(Default)]
    struct EchoSandbox {
        down: AtomicBool,
        hold: AtomicBool,
    }

    #[async_trait]
    impl Sandbox for EchoSandbox {
        fn name(&self) -> &str {
            "echo"
        }

        async fn compile(
            &self,
            _request_id: Uuid,
            source_code: &str,
            _deadline: Deadline,
        ) -> Result<CompileOutcome, SandboxError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SandboxError::Unavailable("docker is down".into()));
            }
            Ok(CompileOutcome::Success(CompiledArtifact {
                archive: source_code.as_bytes().to_vec(),
            }))
        }

        async fn run_test(
            &self,
            _request_id: Uuid,
            _test_index: usize,
            _artifact: &CompiledArtifact,
            input: &str,
            _limits: &RunLimits,
        ) -> Result<RunOutput, SandboxError> {
            while self.hold.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(RunOutput {
                stdout: input.to_string(),
                exit_code: Some(0),
                ..Default::default()
            })
        }

        async fn ping(&self) -> Result<(), SandboxError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SandboxError::Unavailable("docker is down".into()));
            }
            Ok(())
        }
    }

    fn state(slots: usize, queue_timeout: Duration) -> Arc<RunnerState<EchoSandbox>> {
        Arc::new(RunnerState::new(
            Orchestrator::new(EchoSandbox::default(), LimitPolicy::default()),
            TOKEN,
            slots,
            queue_timeout,
        ))
    }

    fn execute_request(token: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/execute")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn submission() -> String {
        let request = ExecutionRequest::new(
            "class Main {}",
            vec![TestCase::new("hi", "hi"), TestCase::new("yo", "no")],
        );
        serde_json::to_string(&request).unwrap()
    }

    async fn error_code(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        body.code
    }

    #[tokio::test]
    async fn test_execute_returns_graded_result() {
        let app = router(state(2, Duration::from_secs(1)));

        let response = app
            .oneshot(execute_request(Some(TOKEN), submission()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let result: ExecutionResult = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result.status, ExecutionStatus::Fail);
        assert_eq!(result.test_results.len(), 2);
        assert!(result.test_results[0].passed);
    }

    #[tokio::test]
    async fn test_execute_requires_token() {
        let app = router(state(2, Duration::from_secs(1)));

        let missing = app
            .clone()
            .oneshot(execute_request(None, submission()))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(execute_request(Some("guess"), submission()))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(wrong).await, "unauthorized");
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_error() {
        let app = router(state(2, Duration::from_secs(1)));

        let response = app
            .oneshot(execute_request(Some(TOKEN), "{\"sourceCode\": 1}".into()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "validation_error");
    }

    #[tokio::test]
    async fn test_oversized_source_is_413() {
        let app = router(state(2, Duration::from_secs(1)));
        let request = ExecutionRequest::new(
            "x".repeat(codegrade_common::limits::MAX_SOURCE_CHARS + 1),
            vec![TestCase::new("", "")],
        );

        let response = app
            .oneshot(execute_request(Some(TOKEN), serde_json::to_string(&request).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error_code(response).await, "payload_too_large");
    }

    #[tokio::test]
    async fn test_sandbox_down_is_503() {
        let state = state(2, Duration::from_secs(1));
        state.orchestrator.sandbox().down.store(true, Ordering::SeqCst);
        let app = router(state);

        let response = app
            .oneshot(execute_request(Some(TOKEN), submission()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "sandbox_unavailable");
    }

    #[tokio::test]
    async fn test_full_slots_report_busy() {
        let state = state(1, Duration::from_millis(50));
        state.orchestrator.sandbox().hold.store(true, Ordering::SeqCst);
        let app = router(state.clone());

        let first = tokio::spawn(
            app.clone()
                .oneshot(execute_request(Some(TOKEN), submission())),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = app
            .oneshot(execute_request(Some(TOKEN), submission()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(second).await, "executor_busy");

        state.orchestrator.sandbox().hold.store(false, Ordering::SeqCst);
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reflects_sandbox_ping() {
        let state = state(1, Duration::from_secs(1));
        let app = router(state.clone());
        let health_request = || {
            Request::builder()
                .uri("/health")
                .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(health_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["uptimeMs"].is_u64());

        state.orchestrator.sandbox().down.store(true, Ordering::SeqCst);
        let response = app.oneshot(health_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
