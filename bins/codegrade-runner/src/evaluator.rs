/// Verdict Aggregator
///
/// **Core Responsibility:**
/// Judge raw run outputs against test cases and reduce them to one verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or the HTTP surface
/// - Pure functions: (test cases, run outputs) → ExecutionResult
/// - One TestResult per test case, in test-case order
///
/// **Verdict Precedence (first match wins):**
/// 1. COMPILE_ERROR if compilation failed (no tests are run)
/// 2. TIMEOUT if any test timed out
/// 3. RUNTIME_ERROR if any test crashed or exceeded its memory limit
/// 4. ERROR if any test could not be judged because its sandbox failed
/// 5. FAIL if any test's output did not match
/// 6. PASS otherwise (hidden and visible tests alike)
///
/// **Normalization Rules (applied to actual and expected, every test):**
/// - `\r\n` becomes `\n`
/// - Leading and trailing whitespace of the whole output is trimmed
/// - Inner whitespace, blank lines and case are preserved
/// - Truncated output never passes an asserting test

use codegrade_common::types::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, TestCase, TestOutcome, TestResult,
};
use std::borrow::Cow;

use crate::sandbox::RunOutput;

pub const BUDGET_EXHAUSTED: &str = "submission time budget exhausted";

fn normalize_output(output: &str) -> Cow<'_, str> {
    if output.contains('\r') {
        Cow::Owned(output.replace("\r\n", "\n").trim().to_string())
    } else {
        Cow::Borrowed(output.trim())
    }
}

fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Judge a single test run.
pub fn evaluate_test(test_index: usize, output: &RunOutput, test_case: &TestCase) -> TestResult {
    let (outcome, error) = if let Some(ref message) = output.sandbox_error {
        (TestOutcome::SandboxError, Some(message.clone()))
    } else if output.skipped {
        (TestOutcome::Timeout, Some(BUDGET_EXHAUSTED.to_string()))
    } else if output.timed_out {
        (
            TestOutcome::Timeout,
            Some(format!("time limit exceeded after {}ms", output.execution_ms)),
        )
    } else if output.memory_exceeded {
        (TestOutcome::RuntimeError, Some("memory limit exceeded".to_string()))
    } else if output.exit_code != Some(0) {
        let message = match output.exit_code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated without an exit code".to_string(),
        };
        (TestOutcome::RuntimeError, Some(message))
    } else if !test_case.assert_output {
        (TestOutcome::Passed, None)
    } else if output.truncated {
        (
            TestOutcome::Failed,
            Some("output limit exceeded; output was truncated".to_string()),
        )
    } else if outputs_match(&output.stdout, &test_case.expected_output) {
        (TestOutcome::Passed, None)
    } else {
        (TestOutcome::Failed, None)
    };

    // Runs that never produced output report no actual value
    let actual = if output.skipped || output.sandbox_error.is_some() {
        None
    } else {
        Some(output.stdout.clone())
    };

    TestResult {
        test_index,
        input: test_case.input.clone(),
        expected: test_case.expected_output.clone(),
        actual,
        passed: outcome == TestOutcome::Passed,
        error,
        outcome,
        is_hidden: test_case.is_hidden,
        execution_ms: output.execution_ms,
        stderr: output.stderr.clone(),
        truncated: output.truncated,
    }
}

/// Reduce per-test outcomes to the overall verdict.
pub fn aggregate_status(results: &[TestResult]) -> ExecutionStatus {
    let any = |outcome: TestOutcome| results.iter().any(|r| r.outcome == outcome);

    if any(TestOutcome::Timeout) {
        ExecutionStatus::Timeout
    } else if any(TestOutcome::RuntimeError) {
        ExecutionStatus::RuntimeError
    } else if any(TestOutcome::SandboxError) {
        ExecutionStatus::Error
    } else if results.iter().all(|r| r.passed) {
        ExecutionStatus::Pass
    } else {
        ExecutionStatus::Fail
    }
}

/// Result for a submission whose compilation failed. No test ran.
pub fn compile_failure(
    request: &ExecutionRequest,
    diagnostics: String,
    execution_ms: u64,
) -> ExecutionResult {
    ExecutionResult {
        request_id: request.request_id,
        status: ExecutionStatus::CompileError,
        stdout: String::new(),
        stderr: diagnostics.clone(),
        compile_error: Some(diagnostics),
        execution_ms,
        test_results: Vec::new(),
    }
}

/// Evaluate all runs of a compiled submission.
///
/// `outputs` holds exactly one entry per test case, in test-case order.
pub fn evaluate(
    request: &ExecutionRequest,
    outputs: &[RunOutput],
    execution_ms: u64,
) -> ExecutionResult {
    debug_assert_eq!(outputs.len(), request.test_cases.len());

    let test_results: Vec<TestResult> = request
        .test_cases
        .iter()
        .zip(outputs)
        .enumerate()
        .map(|(idx, (test_case, output))| evaluate_test(idx, output, test_case))
        .collect();

    let status = aggregate_status(&test_results);
    let (stdout, stderr) = outputs
        .first()
        .map(|o| (o.stdout.clone(), o.stderr.clone()))
        .unwrap_or_default();

    ExecutionResult {
        request_id: request.request_id,
        status,
        stdout,
        stderr,
        compile_error: None,
        execution_ms,
        test_results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_output(stdout: &str) -> RunOutput {
        RunOutput {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            execution_ms: 12,
            ..Default::default()
        }
    }

    fn crashed_output(code: i64) -> RunOutput {
        RunOutput {
            stderr: "Exception in thread \"main\"".to_string(),
            exit_code: Some(code),
            ..Default::default()
        }
    }

    fn request_with(expected: &[&str]) -> ExecutionRequest {
        ExecutionRequest::new(
            "class Main {}",
            expected.iter().map(|e| TestCase::new("in", *e)).collect(),
        )
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("\n  hello \n"), "hello");
        assert_eq!(normalize_output("a\r\nb\r\n"), "a\nb");
        assert_eq!(normalize_output("   "), "");
    }

    #[test]
    fn test_inner_whitespace_and_case_matter() {
        assert!(!outputs_match("a  b", "a b"));
        assert!(!outputs_match("Hello", "hello"));
        assert!(outputs_match("line1\nline2\n", "line1\nline2"));
        assert!(outputs_match("line1\r\nline2\r\n", "line1\nline2"));
    }

    #[test]
    fn test_hello_passes() {
        let result = evaluate_test(0, &ok_output("Hello\n"), &TestCase::new("", "Hello"));
        assert!(result.passed);
        assert_eq!(result.outcome, TestOutcome::Passed);
        assert_eq!(result.actual.as_deref(), Some("Hello\n"));
        assert_eq!(result.error, None);
    }

    #[test]
    fn test_mismatch_fails() {
        let result = evaluate_test(0, &ok_output("Bye"), &TestCase::new("", "Hello"));
        assert!(!result.passed);
        assert_eq!(result.outcome, TestOutcome::Failed);
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        let result = evaluate_test(0, &crashed_output(1), &TestCase::new("", ""));
        assert_eq!(result.outcome, TestOutcome::RuntimeError);
        assert_eq!(result.error.as_deref(), Some("process exited with code 1"));
    }

    #[test]
    fn test_memory_exceeded_is_runtime_error() {
        let output = RunOutput {
            exit_code: Some(137),
            memory_exceeded: true,
            ..Default::default()
        };
        let result = evaluate_test(0, &output, &TestCase::new("", ""));
        assert_eq!(result.outcome, TestOutcome::RuntimeError);
        assert_eq!(result.error.as_deref(), Some("memory limit exceeded"));
    }

    #[test]
    fn test_timeout_reports_elapsed() {
        let output = RunOutput {
            timed_out: true,
            execution_ms: 2_001,
            ..Default::default()
        };
        let result = evaluate_test(0, &output, &TestCase::new("", "x"));
        assert!(!result.passed);
        assert_eq!(result.outcome, TestOutcome::Timeout);
        assert!(result.error.unwrap().contains("2001ms"));
    }

    #[test]
    fn test_skipped_test_has_no_actual() {
        let result = evaluate_test(3, &RunOutput::budget_exhausted(), &TestCase::new("", "x"));
        assert_eq!(result.test_index, 3);
        assert_eq!(result.outcome, TestOutcome::Timeout);
        assert_eq!(result.actual, None);
        assert_eq!(result.error.as_deref(), Some(BUDGET_EXHAUSTED));
    }

    #[test]
    fn test_truncated_output_never_passes() {
        let output = RunOutput {
            truncated: true,
            ..ok_output("expected")
        };
        let result = evaluate_test(0, &output, &TestCase::new("", "expected"));
        assert_eq!(result.outcome, TestOutcome::Failed);
    }

    #[test]
    fn test_capture_only_passes_on_clean_run() {
        let result = evaluate_test(0, &ok_output("anything"), &TestCase::capture_only());
        assert!(result.passed);

        let result = evaluate_test(0, &crashed_output(1), &TestCase::capture_only());
        assert!(!result.passed);
    }

    #[test]
    fn test_timeout_beats_everything() {
        let request = request_with(&["a", "b", "c", "d"]);
        let outputs = vec![
            ok_output("wrong"),
            crashed_output(1),
            RunOutput::timed_out_after(std::time::Duration::from_millis(2_000)),
            RunOutput::sandbox_failure("container start failed"),
        ];
        let result = evaluate(&request, &outputs, 10);
        assert_eq!(result.status, ExecutionStatus::Timeout);
    }

    #[test]
    fn test_runtime_error_beats_sandbox_error_and_fail() {
        let request = request_with(&["a", "b", "c"]);
        let outputs = vec![
            ok_output("wrong"),
            RunOutput::sandbox_failure("container start failed"),
            crashed_output(1),
        ];
        assert_eq!(evaluate(&request, &outputs, 0).status, ExecutionStatus::RuntimeError);
    }

    #[test]
    fn test_sandbox_error_beats_fail() {
        let request = request_with(&["a", "b"]);
        let outputs = vec![ok_output("wrong"), RunOutput::sandbox_failure("boom")];
        assert_eq!(evaluate(&request, &outputs, 0).status, ExecutionStatus::Error);
    }

    #[test]
    fn test_fail_when_any_mismatch() {
        let request = request_with(&["a", "b"]);
        let outputs = vec![ok_output("a"), ok_output("x")];
        let result = evaluate(&request, &outputs, 0);
        assert_eq!(result.status, ExecutionStatus::Fail);
        assert!(result.test_results[0].passed);
        assert!(!result.test_results[1].passed);
    }

    #[test]
    fn test_pass_requires_hidden_tests_too() {
        let mut request = request_with(&["a", "b"]);
        request.test_cases[1].is_hidden = true;

        let result = evaluate(&request, &[ok_output("a"), ok_output("b")], 0);
        assert_eq!(result.status, ExecutionStatus::Pass);
        assert!(result.test_results[1].is_hidden);

        let result = evaluate(&request, &[ok_output("a"), ok_output("nope")], 0);
        assert_eq!(result.status, ExecutionStatus::Fail);
    }

    #[test]
    fn test_results_follow_test_case_order() {
        let request = request_with(&["0", "1", "2", "3"]);
        let outputs: Vec<RunOutput> = (0..4).map(|i| ok_output(&i.to_string())).collect();
        let result = evaluate(&request, &outputs, 0);

        assert_eq!(result.test_results.len(), request.test_cases.len());
        for (i, tr) in result.test_results.iter().enumerate() {
            assert_eq!(tr.test_index, i);
            assert!(tr.passed);
        }
        assert_eq!(result.status, ExecutionStatus::Pass);
    }

    #[test]
    fn test_run_output_comes_from_first_test() {
        let request = request_with(&["first", "second"]);
        let result = evaluate(&request, &[ok_output("first"), ok_output("second")], 0);
        assert_eq!(result.stdout, "first");
        assert_eq!(result.compile_error, None);
    }

    #[test]
    fn test_compile_failure_has_no_test_results() {
        let request = request_with(&["a"]);
        let result = compile_failure(&request, "Main.java:1: error: ';' expected".into(), 800);
        assert_eq!(result.status, ExecutionStatus::CompileError);
        assert!(result.test_results.is_empty());
        assert!(result.compile_error.unwrap().contains("';' expected"));
        assert_eq!(result.request_id, request.request_id);
    }
}
