// Error responses of the gateway. Grading outcomes are never errors.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use codegrade_common::limits::ValidationError;
use codegrade_common::types::ErrorBody;
use thiserror::Error;

use crate::client::BackendError;
use crate::rate_limit::{Decision, StoreError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("submission rejected by safety rule {rule}: {reason}")]
    SecurityRejection { rule: String, reason: String },

    #[error("rate limit exceeded for {policy}")]
    RateLimited { policy: String, decision: Decision },

    #[error("executor is not configured")]
    ExecutorNotConfigured,

    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),

    /// The executor refused the request; its status and body pass through
    #[error("{}", .body.error)]
    Upstream { status: StatusCode, body: ErrorBody },

    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected { status, body } => {
                match StatusCode::from_u16(status) {
                    // Gateway and runner disagree on the token: a deployment fault
                    Ok(StatusCode::UNAUTHORIZED) | Err(_) => {
                        ApiError::ExecutorUnavailable(format!("executor answered {}", status))
                    }
                    Ok(status) => ApiError::Upstream { status, body },
                }
            }
            other => ApiError::ExecutorUnavailable(other.to_string()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::SecurityRejection { .. } => StatusCode::BAD_REQUEST,
            ApiError::Validation(ValidationError::SourceTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream { status, .. } => *status,
            ApiError::ExecutorNotConfigured
            | ApiError::ExecutorUnavailable(_)
            | ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "validation_error",
            ApiError::Validation(e) => e.code(),
            ApiError::SecurityRejection { .. } => "security_rejection",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::ExecutorNotConfigured => "executor_not_configured",
            ApiError::ExecutorUnavailable(_) => "executor_unavailable",
            ApiError::Upstream { body, .. } => body.code.as_str(),
            ApiError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = ErrorBody::new(self.code(), self.to_string());

        match &self {
            ApiError::SecurityRejection { rule, reason } => {
                body.rule = Some(rule.clone());
                body.reason = Some(reason.clone());
            }
            ApiError::RateLimited { decision, .. } => {
                body.remaining = Some(0);
                body.reset_ms = Some(decision.reset_ms);
            }
            ApiError::Upstream { body: upstream, .. } => body = upstream.clone(),
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { decision, .. } = &self {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
            crate::handlers::insert_rate_limit_headers(headers, decision);
        }
        response
    }
}
