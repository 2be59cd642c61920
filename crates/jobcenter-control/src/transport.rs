//! Ways of reaching a control socket.

use std::path::PathBuf;
use std::process::Stdio;

use jobcenter_core::SshConfig;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{read_message, write_message};
use crate::message::{RawRequest, Response};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// A socket on this host.
    Unix(PathBuf),
    /// A socket on another host, bridged by `ssh` running `socat`.
    Ssh(SshConfig),
}

impl Transport {
    pub fn from_config(config: &SshConfig) -> Self {
        if config.is_local() {
            Transport::Unix(config.socket_path.clone())
        } else {
            Transport::Ssh(config.clone())
        }
    }

    /// Send one request and wait for its response.
    pub async fn round_trip(&self, request: &RawRequest) -> ProtocolResult<Response> {
        match self {
            Transport::Unix(path) => {
                let mut stream = UnixStream::connect(path).await?;
                write_message(&mut stream, request).await?;
                read_message(&mut stream)
                    .await?
                    .ok_or(ProtocolError::ConnectionClosed)
            }
            Transport::Ssh(config) => ssh_round_trip(config, request).await,
        }
    }
}

fn ssh_command(config: &SshConfig) -> Command {
    let mut cmd = match &config.password {
        Some(password) => {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e").arg("ssh").env("SSHPASS", password);
            cmd
        }
        None => {
            let mut cmd = Command::new("ssh");
            cmd.args(["-o", "BatchMode=yes"]);
            cmd
        }
    };
    cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
        .arg("-p")
        .arg(config.port.to_string());
    if let Some(key) = &config.key_file {
        cmd.arg("-i").arg(key);
    }
    let target = if config.username.is_empty() {
        config.hostname.clone()
    } else {
        format!("{}@{}", config.username, config.hostname)
    };
    cmd.arg(target)
        .arg("socat")
        .arg("-")
        .arg(format!("UNIX-CONNECT:{}", config.socket_path.display()));
    cmd
}

async fn ssh_round_trip(config: &SshConfig, request: &RawRequest) -> ProtocolResult<Response> {
    debug!(host = %config.hostname, socket = %config.socket_path.display(), "ssh round trip");
    let mut child = ssh_command(config)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProtocolError::Ssh(format!("failed to spawn ssh: {e}")))?;

    let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(ProtocolError::Ssh("ssh stdio not captured".to_string()));
    };
    write_message(&mut stdin, request).await?;
    let response = read_message::<Response, _>(&mut stdout).await;
    drop(stdin);

    match response {
        Ok(Some(response)) => {
            let _ = child.kill().await;
            Ok(response)
        }
        Ok(None) | Err(ProtocolError::Io(_)) => {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr).await;
            }
            let status = child.wait().await?;
            Err(ProtocolError::Ssh(format!(
                "{status}: {}",
                stderr.trim()
            )))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_uses_the_socket_directly() {
        let t = Transport::from_config(&SshConfig::local("/tmp/jc.sock"));
        assert_eq!(t, Transport::Unix("/tmp/jc.sock".into()));
    }

    #[test]
    fn remote_hosts_go_through_ssh() {
        let config = SshConfig {
            hostname: "node3".to_string(),
            port: 2200,
            username: "jc".to_string(),
            password: None,
            key_file: Some("/etc/jc/key".into()),
            socket_path: "/run/jobcenter/worker.sock".into(),
        };
        assert!(matches!(Transport::from_config(&config), Transport::Ssh(_)));

        let cmd = ssh_command(&config);
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "ssh");
        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["-p", "2200"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/etc/jc/key"]));
        assert!(args.contains(&"jc@node3".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("UNIX-CONNECT:/run/jobcenter/worker.sock")
        );
    }

    #[test]
    fn passwords_go_through_sshpass() {
        let mut config = SshConfig::local("/run/x.sock");
        config.hostname = "node4".to_string();
        config.password = Some("secret".to_string());
        let cmd = ssh_command(&config);
        assert_eq!(cmd.as_std().get_program(), "sshpass");
        assert!(!cmd
            .as_std()
            .get_args()
            .any(|a| a.to_string_lossy().contains("secret")));
    }
}
