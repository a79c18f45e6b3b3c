//! Result formatting: one [`ExecutionResult`] per request, rendered as a
//! [`CommandResponse`] for callers or as a typed [`GateError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::executor::{CapturedOutput, ExecOutcome, ExecState};
use crate::request::ExecutionRequest;
use crate::validator::ValidationError;

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Process exited with status 0.
    Completed,
    /// Process ran but exited non-zero or died from a signal.
    Failed,
    TimedOut,
    /// Cancelled by the caller, before or during execution.
    Killed,
    /// Rejected by the validator or the rate limiter; nothing was spawned.
    Denied,
    InternalError,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::Killed => "killed",
            Outcome::Denied => "denied",
            Outcome::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error classification carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimited,
    Execution,
    Timeout,
    Killed,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    #[error("{0}")]
    Validation(ValidationError),

    #[error("rate limit exceeded; retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("command failed with {}", describe_exit(*exit_code, *signal))]
    Execution {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("command timed out after {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("command was cancelled")]
    Killed,

    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_exit(exit_code: Option<i32>, signal: Option<i32>) -> String {
    match (exit_code, signal) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(sig)) => format!("signal {}", sig),
        (None, None) => "unknown status".to_string(),
    }
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Validation(_) => ErrorKind::Validation,
            GateError::RateLimited { .. } => ErrorKind::RateLimited,
            GateError::Execution { .. } => ErrorKind::Execution,
            GateError::Timeout { .. } => ErrorKind::Timeout,
            GateError::Killed => ErrorKind::Killed,
            GateError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            GateError::Validation(_) | GateError::RateLimited { .. } => Outcome::Denied,
            GateError::Execution { .. } => Outcome::Failed,
            GateError::Timeout { .. } => Outcome::TimedOut,
            GateError::Killed => Outcome::Killed,
            GateError::Internal(_) => Outcome::InternalError,
        }
    }

    /// Callers may retry only rate-limited requests, after `retry_after`.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GateError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Produced exactly once per request.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub request_id: String,
    pub correlation_id: String,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
    pub error: Option<GateError>,
}

impl ExecutionResult {
    /// A request that ended before anything was spawned.
    pub fn rejected(req: &ExecutionRequest, error: GateError, duration: Duration) -> Self {
        Self {
            request_id: req.id().to_string(),
            correlation_id: req.correlation_id().to_string(),
            outcome: error.outcome(),
            exit_code: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration,
            error: Some(error),
        }
    }

    /// Classify a finished execution. `timeout` is the deadline the executor enforced.
    pub fn from_exec(req: &ExecutionRequest, timeout: Duration, exec: ExecOutcome) -> Self {
        let (outcome, error) = match exec.state {
            ExecState::Completed if exec.exit_code == Some(0) => (Outcome::Completed, None),
            ExecState::Completed => (
                Outcome::Failed,
                Some(GateError::Execution {
                    exit_code: exec.exit_code,
                    signal: exec.signal,
                }),
            ),
            ExecState::TimedOut => (Outcome::TimedOut, Some(GateError::Timeout { timeout })),
            ExecState::Killed if exec.error.is_none() => (Outcome::Killed, Some(GateError::Killed)),
            ExecState::Killed | ExecState::SpawnFailed => (
                Outcome::InternalError,
                Some(GateError::Internal(
                    exec.error
                        .clone()
                        .unwrap_or_else(|| "execution failed".to_string()),
                )),
            ),
            ExecState::Pending | ExecState::Running => (
                Outcome::InternalError,
                Some(GateError::Internal(format!(
                    "execution ended in non-terminal state {:?}",
                    exec.state
                ))),
            ),
        };
        Self {
            request_id: req.id().to_string(),
            correlation_id: req.correlation_id().to_string(),
            outcome,
            exit_code: exec.exit_code,
            stdout: exec.stdout,
            stderr: exec.stderr,
            duration: exec.duration,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn to_response(&self) -> CommandResponse {
        CommandResponse {
            ok: self.is_success(),
            request_id: self.request_id.clone(),
            correlation_id: self.correlation_id.clone(),
            outcome: self.outcome,
            exit_code: self.exit_code,
            stdout: self.stdout.text(),
            stderr: self.stderr.text(),
            stdout_truncated: self.stdout.truncated,
            stderr_truncated: self.stderr.truncated,
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            error: self.error.as_ref().map(ErrorBody::from),
        }
    }

    /// `Ok` only for [`Outcome::Completed`].
    pub fn into_result(self) -> Result<CommandResponse, GateError> {
        match &self.error {
            Some(err) if !self.is_success() => Err(err.clone()),
            _ => Ok(self.to_response()),
        }
    }
}

/// Wire form of an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub ok: bool,
    pub request_id: String,
    pub correlation_id: String,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// Validation reason, e.g. "insufficient_role".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&GateError> for ErrorBody {
    fn from(err: &GateError) -> Self {
        let reason = match err {
            GateError::Validation(v) => Some(v.reason().to_string()),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            reason,
            retry_after_ms: err
                .retry_after()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Actor, Role};

    fn request() -> ExecutionRequest {
        ExecutionRequest::new(Actor::new("alice", Role::Viewer), "list-items", vec![])
            .with_correlation_id("corr-1")
    }

    fn exec(state: ExecState, exit_code: Option<i32>) -> ExecOutcome {
        ExecOutcome {
            state,
            exit_code,
            signal: None,
            stdout: CapturedOutput {
                data: b"out".to_vec(),
                truncated: false,
                total_bytes: 3,
            },
            stderr: CapturedOutput {
                data: b"boom".to_vec(),
                truncated: true,
                total_bytes: 9,
            },
            duration: Duration::from_millis(42),
            error: None,
        }
    }

    #[test]
    fn zero_exit_is_completed() {
        let req = request();
        let result =
            ExecutionResult::from_exec(&req, Duration::from_secs(1), exec(ExecState::Completed, Some(0)));
        assert_eq!(result.outcome, Outcome::Completed);
        let resp = result.into_result().unwrap();
        assert!(resp.ok);
        assert_eq!(resp.stdout, "out");
        assert_eq!(resp.correlation_id, "corr-1");
        assert_eq!(resp.duration_ms, 42);
        assert!(resp.error.is_none());
    }

    #[test]
    fn non_zero_exit_is_failed_with_stderr() {
        let req = request();
        let result =
            ExecutionResult::from_exec(&req, Duration::from_secs(1), exec(ExecState::Completed, Some(2)));
        assert_eq!(result.outcome, Outcome::Failed);
        let resp = result.to_response();
        assert!(!resp.ok);
        assert_eq!(resp.stderr, "boom");
        assert!(resp.stderr_truncated);
        assert_eq!(resp.error.as_ref().map(|e| e.kind), Some(ErrorKind::Execution));
        assert!(matches!(
            result.into_result(),
            Err(GateError::Execution { exit_code: Some(2), .. })
        ));
    }

    #[test]
    fn timeout_is_distinct_from_failure() {
        let req = request();
        let result =
            ExecutionResult::from_exec(&req, Duration::from_secs(1), exec(ExecState::TimedOut, None));
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert_eq!(
            result.into_result(),
            Err(GateError::Timeout {
                timeout: Duration::from_secs(1)
            })
        );
    }

    #[test]
    fn spawn_failure_is_internal() {
        let req = request();
        let mut e = exec(ExecState::SpawnFailed, None);
        e.error = Some("no such file".into());
        let result = ExecutionResult::from_exec(&req, Duration::from_secs(1), e);
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(
            result.error,
            Some(GateError::Internal("no such file".into()))
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let req = request();
        let result = ExecutionResult::rejected(
            &req,
            GateError::RateLimited {
                retry_after: Duration::from_millis(750),
            },
            Duration::ZERO,
        );
        assert_eq!(result.outcome, Outcome::Denied);
        let json = serde_json::to_value(result.to_response()).unwrap();
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["error"]["kind"], "rate_limited");
        assert_eq!(json["error"]["retryAfterMs"], 750);
        assert_eq!(json["exitCode"], serde_json::Value::Null);
    }

    #[test]
    fn validation_response_carries_reason() {
        let req = request();
        let result = ExecutionResult::rejected(
            &req,
            GateError::Validation(ValidationError::UnknownCommand("rm".into())),
            Duration::ZERO,
        );
        let body = result.to_response().error.unwrap();
        assert_eq!(body.kind, ErrorKind::Validation);
        assert_eq!(body.reason.as_deref(), Some("unknown_command"));
        assert!(body.retry_after_ms.is_none());
    }
}
