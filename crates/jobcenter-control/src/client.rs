//! Client side of the control socket.

use std::path::PathBuf;
use std::time::Duration;

use jobcenter_core::SshConfig;
use tracing::debug;

use crate::auth::current_username;
use crate::command::CommandSet;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Response;
use crate::transport::Transport;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends commands to one daemon. Each command uses a fresh connection.
#[derive(Debug, Clone)]
pub struct ControlClient {
    transport: Transport,
    username: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            username: current_username(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn local(socket_path: impl Into<PathBuf>) -> Self {
        Self::new(Transport::Unix(socket_path.into()))
    }

    pub fn from_config(config: &SshConfig) -> Self {
        Self::new(Transport::from_config(config))
    }

    /// Claimed username; the server may replace it with the peer's identity.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn send<C: CommandSet>(&self, command: &C) -> ProtocolResult<Response> {
        let request = command.to_request(&self.username)?;
        debug!(command = %request.type_name, user = %self.username, "sending control command");
        tokio::time::timeout(self.timeout, self.transport.round_trip(&request))
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout))?
    }
}
