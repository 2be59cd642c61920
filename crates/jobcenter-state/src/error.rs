//! Error types for the JobCenter database.

use jobcenter_core::{ErrorKind, JobStatus};
use thiserror::Error;

/// Result type alias for database operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {uid}: invalid transition {from} -> {to}")]
    InvalidTransition {
        uid: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("insufficient resources: {0}")]
    Resource(String),
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::NotFound(_) => ErrorKind::NotFound,
            StateError::InvalidTransition { .. } | StateError::Validation(_) => {
                ErrorKind::Validation
            }
            StateError::Resource(_) => ErrorKind::Resource,
            _ => ErrorKind::Transport,
        }
    }

    /// Storage-level failures that may clear up on retry.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}
