mod process;
mod toolchain;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ExecuteResponse, Language};

pub use process::ProcessExecutor;

/// Per-request execution failures. `Display` is the text handed back to the
/// requester in the `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("{0}")]
    ToolchainUnavailable(String),
    #[error("Compilation error: {0}")]
    CompilationFailed(String),
    #[error("Code execution timed out after {0} seconds")]
    ExecutionTimeout(u64),
    #[error("{0}")]
    RuntimeFailure(String),
    #[error("Server-side execution not supported for {0}")]
    UnsupportedLanguage(String),
    #[error("Execution error: {0}")]
    InternalFault(String),
}

impl ExecError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolchainUnavailable(_) => "toolchain_unavailable",
            Self::CompilationFailed(_) => "compilation_failed",
            Self::ExecutionTimeout(_) => "timeout",
            Self::RuntimeFailure(_) => "runtime_failure",
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::InternalFault(_) => "internal_fault",
        }
    }
}

/// Captured standard output, or the classified failure. Never both.
pub type ExecutionResult = Result<String, ExecError>;

impl From<ExecutionResult> for ExecuteResponse {
    fn from(value: ExecutionResult) -> Self {
        match value {
            Ok(output) => ExecuteResponse::output(output),
            Err(err) => ExecuteResponse::error(err.to_string()),
        }
    }
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, code: &str, language: Language, timeout_secs: u64) -> ExecutionResult;
}

/// Stderr with no stdout is a failure; anything else succeeds with stdout.
///
/// The exit status is deliberately not consulted, so a program that only
/// writes warnings to stderr is reported as failed.
pub fn classify(stdout: String, stderr: String) -> ExecutionResult {
    if !stderr.is_empty() && stdout.is_empty() {
        Err(ExecError::RuntimeFailure(stderr))
    } else {
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_only_is_an_error() {
        assert_eq!(
            classify(String::new(), "panic: boom\n".to_string()),
            Err(ExecError::RuntimeFailure("panic: boom\n".to_string()))
        );
    }

    #[test]
    fn stdout_wins_when_both_streams_have_text() {
        assert_eq!(
            classify("partial\n".to_string(), "crash\n".to_string()),
            Ok("partial\n".to_string())
        );
    }

    #[test]
    fn silent_run_is_an_empty_success() {
        assert_eq!(classify(String::new(), String::new()), Ok(String::new()));
    }

    #[test]
    fn response_populates_exactly_one_field() {
        let ok: ExecuteResponse = Ok::<_, ExecError>("hi".to_string()).into();
        assert_eq!(ok.output.as_deref(), Some("hi"));
        assert!(ok.error.is_none());

        let err: ExecuteResponse = Err(ExecError::ExecutionTimeout(10)).into();
        assert!(err.output.is_none());
        assert_eq!(
            err.error.as_deref(),
            Some("Code execution timed out after 10 seconds")
        );
    }
}
