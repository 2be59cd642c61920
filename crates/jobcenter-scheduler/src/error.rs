//! Scheduler error types.

use jobcenter_control::ProtocolError;
use jobcenter_core::{ErrorKind, JobStatus, JobUid, MachineUid};
use jobcenter_state::StateError;
use thiserror::Error;

/// Errors raised by the driver, dispatcher and worker proxies.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("worker {machine} unreachable: {source}")]
    Transport {
        machine: MachineUid,
        #[source]
        source: ProtocolError,
    },

    #[error("work machine {0} has no connection descriptor")]
    NoConnection(MachineUid),

    #[error("job {uid}: no dispatch rule for {from} -> {to}")]
    Violation {
        uid: JobUid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("database still failing after {attempts} attempts: {source}")]
    DatabaseUnavailable {
        attempts: u32,
        #[source]
        source: StateError,
    },
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::State(e) => e.kind(),
            SchedulerError::Violation { .. } => ErrorKind::Validation,
            _ => ErrorKind::Transport,
        }
    }

    /// Storage-layer failure, as opposed to a logical rejection.
    pub fn is_storage(&self) -> bool {
        matches!(self, SchedulerError::State(e) if e.is_storage())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
