use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single instructor-defined test case.
///
/// Supplied by the caller with every request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Wall-clock override in milliseconds (clamped by the runner)
    #[serde(default, rename = "timeLimit", skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    /// Memory override in megabytes (clamped by the runner)
    #[serde(default, rename = "memoryLimit", skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    /// When false the test only captures output and passes on a clean run
    #[serde(default = "default_assert_output")]
    pub assert_output: bool,
}

fn default_assert_output() -> bool {
    true
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            is_hidden: false,
            description: None,
            time_limit_ms: None,
            memory_limit_mb: None,
            assert_output: true,
        }
    }

    /// Synthetic no-assertion test used by demo runs.
    pub fn capture_only() -> Self {
        Self {
            assert_output: false,
            description: Some("output capture".to_string()),
            ..Self::new("", "")
        }
    }

    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    pub fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = Some(ms);
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }
}

/// Submission handed from the gateway to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>, test_cases: Vec<TestCase>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            source_code: source_code.into(),
            test_cases,
        }
    }
}

/// Overall verdict of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pass,
    Fail,
    CompileError,
    RuntimeError,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pass => "PASS",
            ExecutionStatus::Fail => "FAIL",
            ExecutionStatus::CompileError => "COMPILE_ERROR",
            ExecutionStatus::RuntimeError => "RUNTIME_ERROR",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test case run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestOutcome {
    Passed,
    Failed,
    RuntimeError,
    Timeout,
    /// The sandbox for this test could not be created or driven
    SandboxError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_index: usize,
    pub input: String,
    pub expected: String,
    pub actual: Option<String>,
    pub passed: bool,
    pub error: Option<String>,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub execution_ms: u64,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub compile_error: Option<String>,
    pub execution_ms: u64,
    pub test_results: Vec<TestResult>,
}

/// Body of every non-200 response from the gateway and the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_ms: Option<u64>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            ..Default::default()
        }
    }
}
