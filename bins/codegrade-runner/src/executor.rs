/// Submission Orchestrator - High-Level Flow
///
/// **Responsibility:**
/// Drive one submission through its state machine:
///
/// `PENDING → COMPILING → COMPILE_ERROR | RUNNING_TESTS → DONE`
///
/// **Architecture:**
/// 1. Validate the request against hard limits
/// 2. Compile once through the `Sandbox` (engine.rs in production)
/// 3. Run every test case in order, each in a fresh sandbox
/// 4. Hand raw outputs to the evaluator for the verdict
///
/// A single `Deadline` for the whole submission is threaded through every
/// step. Tests that cannot start before it are reported as timed out, so the
/// result always holds one entry per test case.
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (the sandbox's job)
/// - How outputs are judged (the evaluator's job)

use codegrade_common::limits::{validate_submission, ValidationError, MAX_SOURCE_CHARS};
use codegrade_common::types::{ExecutionRequest, ExecutionResult};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LimitPolicy;
use crate::evaluator;
use crate::sandbox::{CompileOutcome, Deadline, RunOutput, Sandbox, SandboxError};

/// Time allowed on top of a test's own timeout for container setup and
/// teardown before the orchestrator gives up on the sandbox call.
const SANDBOX_GRACE: Duration = Duration::from_secs(10);

pub const COMPILE_TIMED_OUT: &str = "compilation timed out";

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub struct Orchestrator<S: Sandbox> {
    sandbox: S,
    limits: LimitPolicy,
}

impl<S: Sandbox> Orchestrator<S> {
    pub fn new(sandbox: S, limits: LimitPolicy) -> Self {
        Self { sandbox, limits }
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    pub fn limits(&self) -> &LimitPolicy {
        &self.limits
    }

    /// Execute a submission end to end.
    ///
    /// Compile, runtime and timeout outcomes come back as `Ok` with the
    /// matching status. `Err` is reserved for bad input and for a sandbox
    /// backend that cannot be used at all.
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_id = %request.request_id,
            test_count = request.test_cases.len(),
            sandbox = self.sandbox.name()
        )
    )]
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecuteError> {
        validate_submission(&request.source_code, &request.test_cases, MAX_SOURCE_CHARS)?;

        let started = Instant::now();
        let deadline = Deadline::after(self.limits.submission_budget());
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        // COMPILING
        let compile_deadline = deadline.capped(self.limits.compile_timeout());
        let artifact = match self
            .sandbox
            .compile(request.request_id, &request.source_code, compile_deadline)
            .await?
        {
            CompileOutcome::Success(artifact) => artifact,
            CompileOutcome::Failed { diagnostics } => {
                info!(execution_ms = elapsed_ms(), "Submission finished with compile error");
                return Ok(evaluator::compile_failure(request, diagnostics, elapsed_ms()));
            }
            CompileOutcome::TimedOut { after_ms } => {
                warn!(after_ms, "Compilation timed out");
                return Ok(evaluator::compile_failure(
                    request,
                    COMPILE_TIMED_OUT.to_string(),
                    elapsed_ms(),
                ));
            }
        };

        // RUNNING_TESTS
        let mut outputs: Vec<RunOutput> = Vec::with_capacity(request.test_cases.len());
        for (idx, test_case) in request.test_cases.iter().enumerate() {
            if deadline.is_expired() {
                warn!(test_index = idx, "Submission budget exhausted; skipping test");
                outputs.push(RunOutput::budget_exhausted());
                continue;
            }

            let limits = self.limits.clamp(test_case, deadline.remaining());
            let backstop = Deadline::at(deadline.instant() + SANDBOX_GRACE);
            let run_started = Instant::now();

            let run = tokio::time::timeout_at(
                backstop.instant(),
                self.sandbox.run_test(
                    request.request_id,
                    idx,
                    &artifact,
                    &test_case.input,
                    &limits,
                ),
            )
            .await;

            let output = match run {
                Ok(Ok(output)) => output,
                // Backend gone: no point trying the remaining tests
                Ok(Err(e @ SandboxError::Unavailable(_))) => return Err(e.into()),
                Ok(Err(e @ SandboxError::Operation(_))) => {
                    warn!(test_index = idx, error = %e, "Sandbox failed for test");
                    RunOutput::sandbox_failure(e.to_string())
                }
                Err(_) => {
                    warn!(test_index = idx, "Sandbox call overran the submission deadline");
                    RunOutput::timed_out_after(run_started.elapsed())
                }
            };

            debug!(
                test_index = idx,
                execution_ms = output.execution_ms,
                timed_out = output.timed_out,
                exit_code = ?output.exit_code,
                "Test executed"
            );
            outputs.push(output);
        }

        // DONE
        let result = evaluator::evaluate(request, &outputs, elapsed_ms());
        info!(
            status = %result.status,
            execution_ms = result.execution_ms,
            passed = result.test_results.iter().filter(|r| r.passed).count(),
            "Submission finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CompiledArtifact, RunLimits};
    use async_trait::async_trait;
    use codegrade_common::types::{ExecutionStatus, TestCase, TestOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    /// In-process stand-in for the Docker engine.
    ///
    /// Understands a tiny "program" language so tests can describe behavior
    /// in the source text:
    /// - `syntax error` anywhere: compilation fails
    /// - `slow compile`: compilation never finishes
    /// - `loop`: never terminates
    /// - `crash`: exits with code 1
    /// - `echo`: prints its input
    /// - `print:<text>`: prints `<text>`
    /// - `flaky`: the sandbox fails for test index 1
    /// - `down`: the backend disappears after compilation
    #[derive(Default)]
    struct ScriptedSandbox {
        compiles: AtomicUsize,
        runs: AtomicUsize,
        live: Arc<AtomicUsize>,
    }

    struct LiveRun(Arc<AtomicUsize>);

    impl Drop for LiveRun {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn program(artifact: &CompiledArtifact) -> String {
        String::from_utf8_lossy(&artifact.archive).into_owned()
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn compile(
            &self,
            _request_id: Uuid,
            source_code: &str,
            deadline: Deadline,
        ) -> Result<CompileOutcome, SandboxError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if source_code.contains("slow compile") {
                tokio::time::sleep_until(deadline.instant()).await;
                return Ok(CompileOutcome::TimedOut { after_ms: 50 });
            }
            if source_code.contains("syntax error") {
                return Ok(CompileOutcome::Failed {
                    diagnostics: "Main.java:3: error: ';' expected".to_string(),
                });
            }
            Ok(CompileOutcome::Success(CompiledArtifact {
                archive: source_code.as_bytes().to_vec(),
            }))
        }

        async fn run_test(
            &self,
            _request_id: Uuid,
            test_index: usize,
            artifact: &CompiledArtifact,
            input: &str,
            limits: &RunLimits,
        ) -> Result<RunOutput, SandboxError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            let _live = LiveRun(self.live.clone());

            let source = program(artifact);
            if source.contains("down") {
                return Err(SandboxError::Unavailable("daemon went away".into()));
            }
            if source.contains("flaky") && test_index == 1 {
                return Err(SandboxError::Operation("container start failed".into()));
            }
            if source.contains("loop") {
                let started = Instant::now();
                tokio::time::sleep(limits.timeout).await;
                return Ok(RunOutput::timed_out_after(started.elapsed()));
            }
            if source.contains("crash") {
                return Ok(RunOutput {
                    stderr: "Exception in thread \"main\" java.lang.ArithmeticException".into(),
                    exit_code: Some(1),
                    ..Default::default()
                });
            }

            let stdout = if source.contains("echo") {
                input.to_string()
            } else if let Some(text) = source.split("print:").nth(1) {
                format!("{}\n", text.trim())
            } else {
                String::new()
            };
            // Yield so concurrent submissions interleave
            tokio::task::yield_now().await;

            Ok(RunOutput {
                stdout,
                exit_code: Some(0),
                execution_ms: 1,
                ..Default::default()
            })
        }

        async fn ping(&self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn orchestrator() -> Orchestrator<ScriptedSandbox> {
        Orchestrator::new(ScriptedSandbox::default(), LimitPolicy::default())
    }

    fn fast_limits() -> LimitPolicy {
        LimitPolicy {
            min_time_limit_ms: 10,
            ..LimitPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_hello_passes() {
        let orch = orchestrator();
        let request = ExecutionRequest::new("print:Hello", vec![TestCase::new("", "Hello")]);

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Pass);
        assert!(result.test_results[0].passed);
        assert_eq!(result.stdout, "Hello\n");
        assert_eq!(result.request_id, request.request_id);
    }

    #[tokio::test]
    async fn test_syntax_error_short_circuits() {
        let orch = orchestrator();
        let request = ExecutionRequest::new(
            "syntax error",
            vec![TestCase::new("", "a"), TestCase::new("", "b")],
        );

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::CompileError);
        assert!(result.compile_error.is_some());
        assert!(result.test_results.is_empty());
        assert_eq!(orch.sandbox().runs.load(Ordering::SeqCst), 0, "no test may run");
    }

    #[tokio::test]
    async fn test_compile_timeout_is_compile_error() {
        let limits = LimitPolicy {
            compile_timeout_ms: 50,
            ..LimitPolicy::default()
        };
        let orch = Orchestrator::new(ScriptedSandbox::default(), limits);
        let request = ExecutionRequest::new("slow compile", vec![TestCase::new("", "")]);

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::CompileError);
        assert_eq!(result.compile_error.as_deref(), Some(COMPILE_TIMED_OUT));
        assert!(result.test_results.is_empty());
    }

    #[tokio::test]
    async fn test_compiles_once_and_runs_every_test_after_failures() {
        let orch = orchestrator();
        let request = ExecutionRequest::new(
            "echo",
            vec![
                TestCase::new("1", "1"),
                TestCase::new("2", "nope"),
                TestCase::new("3", "3"),
                TestCase::new("4", "4").hidden(),
            ],
        );

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(orch.sandbox().compiles.load(Ordering::SeqCst), 1);
        assert_eq!(orch.sandbox().runs.load(Ordering::SeqCst), 4);
        assert_eq!(result.status, ExecutionStatus::Fail);
        assert_eq!(result.test_results.len(), 4);
        for (i, tr) in result.test_results.iter().enumerate() {
            assert_eq!(tr.test_index, i);
        }
        assert!(!result.test_results[1].passed);
        assert!(result.test_results[2].passed);
        assert!(result.test_results[3].passed);
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let orch = Orchestrator::new(ScriptedSandbox::default(), fast_limits());
        let request = ExecutionRequest::new(
            "loop",
            vec![TestCase::new("", "x").with_time_limit_ms(50)],
        );

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!result.test_results[0].passed);
        assert_eq!(result.test_results[0].outcome, TestOutcome::Timeout);
        assert!(result.test_results[0].error.is_some());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_keeps_one_result_per_test() {
        let limits = LimitPolicy {
            min_time_limit_ms: 10,
            submission_budget_ms: 120,
            ..LimitPolicy::default()
        };
        let orch = Orchestrator::new(ScriptedSandbox::default(), limits);
        let request = ExecutionRequest::new(
            "loop",
            vec![
                TestCase::new("", "").with_time_limit_ms(100),
                TestCase::new("", "").with_time_limit_ms(100),
                TestCase::new("", "").with_time_limit_ms(100),
            ],
        );

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.test_results.len(), 3);
        let last = &result.test_results[2];
        assert_eq!(last.outcome, TestOutcome::Timeout);
        assert_eq!(last.error.as_deref(), Some(evaluator::BUDGET_EXHAUSTED));
        assert!(
            orch.sandbox().runs.load(Ordering::SeqCst) < 3,
            "tests past the budget must not start"
        );
    }

    #[tokio::test]
    async fn test_crash_is_runtime_error() {
        let orch = orchestrator();
        let request = ExecutionRequest::new("crash", vec![TestCase::new("", "")]);

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("ArithmeticException"));
    }

    #[tokio::test]
    async fn test_single_sandbox_failure_is_error_verdict() {
        let orch = orchestrator();
        let request = ExecutionRequest::new(
            "flaky echo",
            vec![TestCase::new("a", "a"), TestCase::new("b", "b"), TestCase::new("c", "c")],
        );

        let result = orch.execute(&request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.test_results[1].outcome, TestOutcome::SandboxError);
        assert!(result.test_results[2].passed, "later tests still run");
    }

    #[tokio::test]
    async fn test_backend_unavailable_is_an_error() {
        let orch = orchestrator();
        let request = ExecutionRequest::new("down", vec![TestCase::new("", "")]);

        let err = orch.execute(&request).await.unwrap_err();

        assert!(matches!(err, ExecuteError::Sandbox(SandboxError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_request_spends_no_compute() {
        let orch = orchestrator();
        let request = ExecutionRequest::new("print:x", vec![]);

        let err = orch.execute(&request).await.unwrap_err();

        assert!(matches!(err, ExecuteError::Validation(ValidationError::NoTestCases)));
        assert_eq!(orch.sandbox().compiles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_stay_isolated() {
        let orch = Arc::new(orchestrator());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orch = orch.clone();
                tokio::spawn(async move {
                    let text = format!("submission-{}", i);
                    let request = ExecutionRequest::new(
                        format!("print:{}", text),
                        vec![TestCase::new("", text.clone()), TestCase::new("", text.clone())],
                    );
                    (text, orch.execute(&request).await.unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (text, result) = handle.await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Pass);
            for tr in &result.test_results {
                assert_eq!(tr.actual.as_deref().map(str::trim), Some(text.as_str()));
            }
        }
        assert_eq!(orch.sandbox().live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_running_sandbox() {
        let orch = Arc::new(Orchestrator::new(ScriptedSandbox::default(), fast_limits()));
        let request = ExecutionRequest::new(
            "loop",
            vec![TestCase::new("", "").with_time_limit_ms(5_000)],
        );

        let task = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.execute(&request).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.sandbox().live.load(Ordering::SeqCst), 1);

        // Caller went away
        task.abort();
        let _ = task.await;

        assert_eq!(orch.sandbox().live.load(Ordering::SeqCst), 0);
    }
}
