use std::fmt;

use thiserror::Error;

/// How a unit (or the enumeration in front of it) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Units could not be discovered. Aborts the run before dispatch.
    Enumeration,
    /// Reading the source or writing a staged artifact failed.
    UnitIo,
    /// The destination rejected the payload or could not be reached.
    Transfer,
    /// The archive or compression stream could not be built.
    Structural,
    /// The unit was never started, or was aborted, because the run was cancelled.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Enumeration => "enumeration failure",
            FailureKind::UnitIo => "unit I/O failure",
            FailureKind::Transfer => "transfer failure",
            FailureKind::Structural => "structural failure",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Command execution failed: {stderr}")]
    Command { stdout: String, stderr: String },

    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    #[error("Unit I/O failed: {0}")]
    UnitIo(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Archive stream failed: {0}")]
    Structural(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("{failed} of {attempted} units failed; first failure: {first}")]
    PartialFailure {
        attempted: usize,
        failed: usize,
        first: String,
    },
}

impl AppError {
    /// Failure kind recorded in a run outcome for this error.
    ///
    /// Errors that do not name a kind of their own (raw I/O, database, command
    /// failures) happen while a unit reads or stages its source, so they count
    /// as unit I/O failures.
    pub fn kind(&self) -> FailureKind {
        match self {
            AppError::Enumeration(_) | AppError::Config(_) | AppError::UrlParse(_) => {
                FailureKind::Enumeration
            }
            AppError::Transfer(_) => FailureKind::Transfer,
            AppError::Structural(_) => FailureKind::Structural,
            AppError::Cancelled(_) => FailureKind::Cancelled,
            AppError::Io(_)
            | AppError::Sqlx(_)
            | AppError::Command { .. }
            | AppError::UnitIo(_)
            | AppError::PartialFailure { .. } => FailureKind::UnitIo,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
