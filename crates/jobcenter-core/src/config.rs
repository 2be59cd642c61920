//! Server and worker YAML configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::resources::ResourceAllocation;

pub const DEFAULT_SERVER_SOCKET: &str = "/run/jobcenter/server.sock";
pub const DEFAULT_WORKER_SOCKET: &str = "/run/jobcenter/worker.sock";
pub const DEFAULT_ADMIN_GROUP: &str = "jobcenter";

fn read_yaml<T: DeserializeOwned>(path: &Path) -> CoreResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_yaml::from_str(&content)?)
}

/// How to reach a control socket, possibly on another host over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Control socket path on `hostname`.
    pub socket_path: PathBuf,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl SshConfig {
    /// A socket on this host; no ssh hop.
    pub fn local(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            hostname: default_hostname(),
            port: default_ssh_port(),
            username: String::new(),
            password: None,
            key_file: None,
            socket_path: socket_path.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.hostname.as_str(), "" | "localhost" | "127.0.0.1" | "::1")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// redb file; the store is kept in memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Configuration of the central server daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_admin_group")]
    pub admin_group: String,
    #[serde(default)]
    pub database_config: DatabaseConfig,
    #[serde(default)]
    pub email_config: EmailConfig,
    /// Global quantity of each special resource.
    #[serde(default)]
    pub special_resources: BTreeMap<String, i64>,
    #[serde(default = "default_true")]
    pub blocking_enabled: bool,
    #[serde(default = "default_true")]
    pub preemption_enabled: bool,
    /// `0` disables the statistics endpoint.
    #[serde(default)]
    pub web_server_port: u16,
    #[serde(default = "default_server_socket")]
    pub control_socket: PathBuf,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_max_worker_failures")]
    pub max_worker_failures: u32,
    #[serde(default = "default_database_retry_budget")]
    pub database_retry_budget: u32,
}

fn default_admin_group() -> String {
    DEFAULT_ADMIN_GROUP.to_string()
}

fn default_true() -> bool {
    true
}

fn default_server_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SERVER_SOCKET)
}

fn default_worker_socket() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_SOCKET)
}

fn default_command_timeout() -> u64 {
    10
}

fn default_retry_interval() -> u64 {
    5
}

fn default_max_worker_failures() -> u32 {
    3
}

fn default_database_retry_budget() -> u32 {
    3
}

fn default_swap_factor() -> f64 {
    0.5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_group: default_admin_group(),
            database_config: DatabaseConfig::default(),
            email_config: EmailConfig::default(),
            special_resources: BTreeMap::new(),
            blocking_enabled: true,
            preemption_enabled: true,
            web_server_port: 0,
            control_socket: default_server_socket(),
            command_timeout_secs: default_command_timeout(),
            retry_interval_secs: default_retry_interval(),
            max_worker_failures: default_max_worker_failures(),
            database_retry_budget: default_database_retry_budget(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let config: ServerConfig = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> CoreResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if let Some((tag, qty)) = self.special_resources.iter().find(|(_, q)| **q < 0) {
            return Err(CoreError::Validation(format!(
                "special resource {tag} has negative quantity {qty}"
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(CoreError::Validation(
                "command_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a worker daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Assigned by the server when absent.
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default = "default_admin_group")]
    pub admin_group: String,
    /// How to reach the server's control socket.
    pub server: SshConfig,
    /// How the server reaches this worker; defaults to the local socket.
    #[serde(default)]
    pub connection: Option<SshConfig>,
    #[serde(default = "default_worker_socket")]
    pub control_socket: PathBuf,
    /// Overrides auto-detected resources.
    #[serde(default)]
    pub resources: Option<ResourceAllocation>,
    /// Swap offered as a fraction of memory.
    #[serde(default = "default_swap_factor")]
    pub swap_factor: f64,
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let config: WorkerConfig = read_yaml(path)?;
        if !(0.0..=16.0).contains(&config.swap_factor) {
            return Err(CoreError::Validation(format!(
                "swap_factor {} out of range",
                config.swap_factor
            )));
        }
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> CoreResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Descriptor handed to the server at registration.
    pub fn advertised_connection(&self) -> SshConfig {
        self.connection
            .clone()
            .unwrap_or_else(|| SshConfig::local(self.control_socket.clone()))
    }
}
