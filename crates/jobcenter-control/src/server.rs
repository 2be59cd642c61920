//! Accept loop of a daemon's local control socket.
//!
//! Connections are served one at a time: read one request, authorize it,
//! hand it to the [`CommandHandler`], write the response, close. Reading the
//! request and writing the response are each bounded by the I/O timeout, so
//! an idle peer cannot hold the socket. The loop
//! ends when the handler reports it is no longer running (after a
//! `KillCommand`) or the shutdown channel fires.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_core::ErrorKind;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::{Caller, GroupAuthorizer, username_for_uid};
use crate::command::CommandSet;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{read_message, write_message};
use crate::message::{RawRequest, Response};

/// Default deadline for reading a request or writing a response.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Command: CommandSet;

    /// Execute an authorized command.
    async fn handle(&self, caller: &Caller, command: Self::Command) -> Response;

    /// Cleared once the daemon should stop accepting commands.
    fn is_running(&self) -> bool;
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    authorizer: GroupAuthorizer,
    trust_claimed_usernames: bool,
    io_timeout: Duration,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path, authorizer: GroupAuthorizer) -> ProtocolResult<Self> {
        let bind_err = |source| ProtocolError::Bind {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        if path.exists() {
            std::fs::remove_file(path).map_err(bind_err)?;
        }
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(bind_err)?;
        info!(socket = %path.display(), group = %authorizer.admin_group(), "control socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            authorizer,
            trust_claimed_usernames: false,
            io_timeout: DEFAULT_IO_TIMEOUT,
        })
    }

    /// Take the `username` field at face value instead of the peer's
    /// credentials. Peers running as root are always trusted.
    pub fn trust_claimed_usernames(mut self, trust: bool) -> Self {
        self.trust_claimed_usernames = trust;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn serve<H: CommandHandler>(
        self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProtocolResult<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            if let Err(e) = self.serve_connection(stream, handler.as_ref()).await {
                                warn!(error = %e, "control connection failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                    if !handler.is_running() {
                        info!("control socket stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    debug!("control socket shutdown requested");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }

    async fn serve_connection<H: CommandHandler>(
        &self,
        mut stream: UnixStream,
        handler: &H,
    ) -> ProtocolResult<()> {
        let read = tokio::time::timeout(self.io_timeout, read_message::<RawRequest, _>(&mut stream))
            .await
            .map_err(|_| ProtocolError::Timeout(self.io_timeout))?;
        let request = match read {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e @ (ProtocolError::Yaml(_) | ProtocolError::NotUtf8)) => {
                let response = Response::error(ErrorKind::Validation, e.to_string());
                return self.reply(&mut stream, &response).await;
            }
            Err(e) => return Err(e),
        };
        let username = self.effective_username(&stream, &request);
        let response = self.dispatch(handler, request, username).await;
        self.reply(&mut stream, &response).await
    }

    async fn reply(&self, stream: &mut UnixStream, response: &Response) -> ProtocolResult<()> {
        tokio::time::timeout(self.io_timeout, write_message(stream, response))
            .await
            .map_err(|_| ProtocolError::Timeout(self.io_timeout))?
    }

    fn effective_username(&self, stream: &UnixStream, request: &RawRequest) -> String {
        let peer = stream
            .peer_cred()
            .ok()
            .and_then(|cred| username_for_uid(cred.uid()));
        match peer {
            Some(name) if !self.trust_claimed_usernames && name != "root" => name,
            Some(name) if request.username.is_empty() => name,
            _ => request.username.clone(),
        }
    }

    async fn dispatch<H: CommandHandler>(
        &self,
        handler: &H,
        request: RawRequest,
        username: String,
    ) -> Response {
        let command = match H::Command::from_request(&request) {
            Ok(command) => command,
            Err(e) => {
                debug!(command = %request.type_name, error = %e, "rejected request");
                return Response::error(e.kind(), e.to_string());
            }
        };
        let caller = self.authorizer.caller(username);
        if command.requires_admin() && !caller.is_admin {
            warn!(user = %caller.username, command = %request.type_name, "permission denied");
            return Response::permission_denied(&caller.username, &request.type_name);
        }
        debug!(user = %caller.username, command = %request.type_name, "handling command");
        handler.handle(&caller, command).await
    }
}
