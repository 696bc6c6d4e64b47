/// Sandbox Abstraction
///
/// The orchestrator only talks to this trait. It knows nothing about Docker:
/// the production backend is `DockerEngine` (engine.rs), tests drive the
/// orchestrator with in-process fakes.
///
/// Contract for implementors:
/// - `compile` runs at most once per submission and must not outlive its deadline
/// - every `run_test` call gets a fresh environment with nothing left over from
///   a previous call, and nothing shared with other submissions
/// - every process started for a call is dead and reaped when the call returns,
///   whether it completed, timed out or failed

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The backend itself is down (daemon unreachable, image missing)
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),

    /// A single sandbox operation failed while the backend is up
    #[error("sandbox operation failed: {0}")]
    Operation(String),
}

/// Absolute point in time by which a piece of work must be finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The earlier of this deadline and `budget` from now.
    pub fn capped(&self, budget: Duration) -> Self {
        std::cmp::min(*self, Self::after(budget))
    }
}

/// Limits applied to one test run, already clamped to server ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub output_limit_bytes: usize,
}

/// Compiled program, as an archive that can be unpacked into a fresh sandbox.
#[derive(Debug, Clone, Default)]
pub struct CompiledArtifact {
    pub archive: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Success(CompiledArtifact),
    Failed { diagnostics: String },
    TimedOut { after_ms: u64 },
}

/// Raw result of one test run. Judging happens in the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub execution_ms: u64,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// stdout or stderr hit the output cap
    pub truncated: bool,
    /// Set when the sandbox for this test could not be driven
    pub sandbox_error: Option<String>,
    /// Never started because the submission budget ran out
    pub skipped: bool,
}

impl RunOutput {
    pub fn budget_exhausted() -> Self {
        Self {
            timed_out: true,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn sandbox_failure(message: impl Into<String>) -> Self {
        Self {
            sandbox_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn timed_out_after(elapsed: Duration) -> Self {
        Self {
            timed_out: true,
            execution_ms: elapsed.as_millis() as u64,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn compile(
        &self,
        request_id: Uuid,
        source_code: &str,
        deadline: Deadline,
    ) -> Result<CompileOutcome, SandboxError>;

    async fn run_test(
        &self,
        request_id: Uuid,
        test_index: usize,
        artifact: &CompiledArtifact,
        input: &str,
        limits: &RunLimits,
    ) -> Result<RunOutput, SandboxError>;

    /// Cheap liveness check of the backend
    async fn ping(&self) -> Result<(), SandboxError>;
}

/// Byte buffer that stops growing at `limit` and remembers that it did.
#[derive(Debug)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Decoded once at the end so multi-byte characters split across
    /// chunks survive.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_buffer_truncates_at_limit() {
        let mut buf = CappedBuffer::new(5);
        buf.push(b"abc");
        assert!(!buf.is_truncated());
        buf.push(b"defgh");
        assert!(buf.is_truncated());
        buf.push(b"ijk");
        assert_eq!(buf.into_string(), "abcde");
    }

    #[test]
    fn test_capped_buffer_keeps_split_utf8() {
        let mut buf = CappedBuffer::new(64);
        let bytes = "héllo".as_bytes();
        buf.push(&bytes[..2]);
        buf.push(&bytes[2..]);
        assert_eq!(buf.into_string(), "héllo");
    }

    #[tokio::test]
    async fn test_deadline_capped_picks_earlier() {
        let far = Deadline::after(Duration::from_secs(60));
        let near = far.capped(Duration::from_millis(10));
        assert!(near < far);
        assert!(near.remaining() <= Duration::from_millis(10));

        let already_near = Deadline::after(Duration::from_millis(5));
        assert_eq!(already_near.capped(Duration::from_secs(60)), already_near);
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
