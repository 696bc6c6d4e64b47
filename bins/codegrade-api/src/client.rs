// HTTP client for the sandbox backend (codegrade-runner)

use async_trait::async_trait;
use codegrade_common::types::{ErrorBody, ExecutionRequest, ExecutionResult};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("executor unreachable: {0}")]
    Unreachable(String),

    #[error("executor answered {status}: {}", .body.error)]
    Rejected { status: u16, body: ErrorBody },

    #[error("executor returned an unreadable response: {0}")]
    Decode(String),
}

/// Anything that can grade a submission. The gateway only talks to this.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, BackendError>;
}

pub struct HttpExecutorClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpExecutorClient {
    /// `timeout` bounds the whole round trip, so it must exceed the
    /// runner's submission budget.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl ExecutionBackend for HttpExecutorClient {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, BackendError> {
        let response = self
            .http
            .post(format!("{}/v1/execute", self.base_url))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ExecutionResult>()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text)
            .unwrap_or_else(|_| ErrorBody::new("executor_unavailable", text));
        Err(BackendError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
