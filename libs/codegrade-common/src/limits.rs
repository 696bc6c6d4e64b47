// Hard request limits shared by the gateway and the runner.
// Both sides validate: the gateway before spending rate-limit budget,
// the runner because it never trusts its caller.

use crate::types::TestCase;
use thiserror::Error;

pub const MAX_SOURCE_CHARS: usize = 50_000;
pub const DEMO_MAX_SOURCE_CHARS: usize = 10_000;
pub const MAX_TEST_CASES: usize = 64;
/// Inputs travel base64-encoded inside a single exec argument, which the
/// kernel caps at 128 KiB.
pub const MAX_TEST_INPUT_BYTES: usize = 64 * 1024;
pub const MAX_EXPECTED_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("source code is empty")]
    EmptySource,

    #[error("source code is {actual} characters, limit is {limit}")]
    SourceTooLarge { actual: usize, limit: usize },

    #[error("at least one test case is required")]
    NoTestCases,

    #[error("{count} test cases supplied, limit is {limit}")]
    TooManyTestCases { count: usize, limit: usize },

    #[error("test case {index}: input is {actual} bytes, limit is {limit}")]
    InputTooLarge { index: usize, actual: usize, limit: usize },

    #[error("test case {index}: expected output is {actual} bytes, limit is {limit}")]
    ExpectedOutputTooLarge { index: usize, actual: usize, limit: usize },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::SourceTooLarge { .. } => "payload_too_large",
            _ => "validation_error",
        }
    }
}

/// Validate a submission before any compute is spent on it.
pub fn validate_submission(
    source_code: &str,
    test_cases: &[TestCase],
    max_source_chars: usize,
) -> Result<(), ValidationError> {
    if source_code.trim().is_empty() {
        return Err(ValidationError::EmptySource);
    }

    let chars = source_code.chars().count();
    if chars > max_source_chars {
        return Err(ValidationError::SourceTooLarge {
            actual: chars,
            limit: max_source_chars,
        });
    }

    if test_cases.is_empty() {
        return Err(ValidationError::NoTestCases);
    }
    if test_cases.len() > MAX_TEST_CASES {
        return Err(ValidationError::TooManyTestCases {
            count: test_cases.len(),
            limit: MAX_TEST_CASES,
        });
    }

    for (index, tc) in test_cases.iter().enumerate() {
        if tc.input.len() > MAX_TEST_INPUT_BYTES {
            return Err(ValidationError::InputTooLarge {
                index,
                actual: tc.input.len(),
                limit: MAX_TEST_INPUT_BYTES,
            });
        }
        if tc.expected_output.len() > MAX_EXPECTED_OUTPUT_BYTES {
            return Err(ValidationError::ExpectedOutputTooLarge {
                index,
                actual: tc.expected_output.len(),
                limit: MAX_EXPECTED_OUTPUT_BYTES,
            });
        }
    }

    Ok(())
}
