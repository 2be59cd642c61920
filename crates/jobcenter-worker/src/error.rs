//! Worker error types.

use jobcenter_core::{ErrorCode, JobUid};
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job {0} is already on this worker")]
    Duplicate(JobUid),

    #[error("job {0} is not on this worker")]
    UnknownJob(JobUid),

    #[error("job {0} is not running")]
    NotRunning(JobUid),

    #[error("job {0} is not paused")]
    NotPaused(JobUid),

    #[error("job {0} is still starting")]
    Starting(JobUid),

    #[error("docker {op} failed: {message}")]
    Runtime { op: &'static str, message: String },

    #[error("failed to spawn docker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("malformed container event: {0}")]
    Event(#[from] serde_json::Error),

    #[error("server rejected {command}: {message}")]
    Rejected {
        command: &'static str,
        code: Option<ErrorCode>,
        message: String,
    },

    #[error("control socket error: {0}")]
    Protocol(#[from] jobcenter_control::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] jobcenter_core::CoreError),
}

impl WorkerError {
    pub fn runtime(op: &'static str, message: impl Into<String>) -> Self {
        WorkerError::Runtime {
            op,
            message: message.into(),
        }
    }

    /// Code carried by the failed response sent back to the server.
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::Duplicate(_) => ErrorCode::Duplicate,
            WorkerError::UnknownJob(_) => ErrorCode::UnknownJob,
            WorkerError::NotRunning(_) => ErrorCode::NotRunning,
            WorkerError::NotPaused(_) => ErrorCode::NotPaused,
            WorkerError::Starting(_) => ErrorCode::Resource,
            WorkerError::Runtime { .. } | WorkerError::Spawn(_) | WorkerError::Event(_) => {
                ErrorCode::Runtime
            }
            WorkerError::Rejected { .. } | WorkerError::Protocol(_) => ErrorCode::Transport,
            WorkerError::Config(e) => e.kind().into(),
        }
    }

    /// The server answered and will never accept this request.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            WorkerError::Rejected {
                code: Some(ErrorCode::NotFound | ErrorCode::Validation | ErrorCode::Permission),
                ..
            }
        )
    }
}
