//! Server error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("database error: {0}")]
    State(#[from] jobcenter_state::StateError),

    #[error("control socket error: {0}")]
    Protocol(#[from] jobcenter_control::ProtocolError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] jobcenter_scheduler::SchedulerError),

    #[error("statistics API error: {0}")]
    Api(#[source] std::io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ServerResult<T> = Result<T, ServerError>;
