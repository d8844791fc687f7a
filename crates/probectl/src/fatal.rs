//! Fatal session outcomes and their process exit codes.
//!
//! The session never exits the process itself; it returns a [`FatalError`]
//! and `main` turns the code into the exit status.

use thiserror::Error;

/// Process exit codes, one per fatal category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    /// The run settled with a non-success status.
    TestFailed,
    /// Operational failure outside the session taxonomy.
    Generic,
    NoConcurrency,
    InvalidScriptPath,
    StartTimeout,
    TooManyStarts,
    TooManySystemErrors,
    SystemErrorNoRetry,
    ServerRejected,
    Interrupted,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::TestFailed => 1,
            Self::Generic => 2,
            Self::NoConcurrency => 3,
            Self::InvalidScriptPath => 4,
            Self::StartTimeout => 5,
            Self::TooManyStarts => 6,
            Self::TooManySystemErrors => 7,
            Self::SystemErrorNoRetry => 8,
            Self::ServerRejected => 9,
            Self::Interrupted => 130,
        }
    }
}

/// A condition that ends the session immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FatalError {
    pub code: ExitCode,
    pub message: String,
}

impl FatalError {
    pub fn new(code: ExitCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn no_concurrency(project_id: &str) -> Self {
        Self::new(
            ExitCode::NoConcurrency,
            format!(
                "project {project_id} has no test slots in its subscription\n  → upgrade the plan or contact your account owner"
            ),
        )
    }

    pub fn invalid_script_path(script: &str, location: &str) -> Self {
        Self::new(
            ExitCode::InvalidScriptPath,
            format!("script '{script}' not found in {location}"),
        )
    }

    pub fn start_timeout(minutes: u64) -> Self {
        Self::new(
            ExitCode::StartTimeout,
            format!(
                "failed to start the test run: exceeded start timeout of {minutes} minute(s)\n  → raise it with --start-timeout"
            ),
        )
    }

    pub fn too_many_starts(attempts: u32) -> Self {
        Self::new(
            ExitCode::TooManyStarts,
            format!("too many start attempts ({attempts}), please contact support"),
        )
    }

    pub fn too_many_system_errors(count: u32) -> Self {
        Self::new(
            ExitCode::TooManySystemErrors,
            format!(
                "the test run hit a system error {count} time(s) in a row, please contact support"
            ),
        )
    }

    pub fn system_error_no_retry() -> Self {
        Self::new(
            ExitCode::SystemErrorNoRetry,
            "the test run ended with a system error and automatic retry is disabled",
        )
    }

    pub fn server_rejected(code: &str, message: &str) -> Self {
        Self::new(
            ExitCode::ServerRejected,
            format!("server rejected the test run ({code}): {message}"),
        )
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(ExitCode::Interrupted, message)
    }
}
