//! Core error type and the user-visible error kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::ConfigRead { .. } | CoreError::ConfigParse(_) => ErrorKind::Validation,
        }
    }
}

/// Coarse classification every error surfaces as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed request or illegal status transition.
    Validation,
    /// Admin-only operation requested by a non-admin.
    Permission,
    /// Unknown uid or label.
    NotFound,
    /// Insufficient resources.
    Resource,
    /// Socket or ssh failure.
    Transport,
    /// Container runtime failure.
    Runtime,
}

/// Machine-readable failure code carried by control responses.
///
/// Besides the error kinds, workers report the "already in that state"
/// conditions the dispatcher treats as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Permission,
    NotFound,
    Resource,
    Transport,
    Runtime,
    /// The worker already has a job with that uid.
    Duplicate,
    /// The worker does not know the job.
    UnknownJob,
    NotRunning,
    NotPaused,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => ErrorCode::Validation,
            ErrorKind::Permission => ErrorCode::Permission,
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::Resource => ErrorCode::Resource,
            ErrorKind::Transport => ErrorCode::Transport,
            ErrorKind::Runtime => ErrorCode::Runtime,
        }
    }
}
