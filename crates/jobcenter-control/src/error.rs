//! Control protocol error types.

use jobcenter_core::ErrorKind;
use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),

    #[error("frame is not valid UTF-8")]
    NotUtf8,

    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("ssh transport failed: {0}")]
    Ssh(String),

    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Yaml(_)
            | ProtocolError::NotUtf8
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::InvalidCommand(_) => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Transport,
        }
    }
}
