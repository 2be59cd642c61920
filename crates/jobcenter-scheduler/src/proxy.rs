//! Worker proxies and the per-machine proxy cache.
//!
//! A [`WorkerProxy`] turns the four lifecycle operations into commands on a
//! worker's control socket. `Err` means the worker could not be reached;
//! a worker that answered, even with a refusal, yields `Ok(ProxyReply)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_control::{
    ControlClient, KillJobCommand, PauseJobCommand, Response, ResumeJobCommand, StartJobCommand,
    WorkerCommand,
};
use jobcenter_core::{ErrorCode, Job, MachineUid, WorkMachine};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// What a worker answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReply {
    pub ok: bool,
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl ProxyReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            code: None,
        }
    }

    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            code: Some(code),
        }
    }
}

impl From<Response> for ProxyReply {
    fn from(response: Response) -> Self {
        Self {
            ok: response.is_success,
            message: response.result_string,
            code: response.error,
        }
    }
}

#[async_trait]
pub trait WorkerProxy: Send + Sync {
    /// Start a job. Answers `DUPLICATE` if the worker already has it.
    async fn dispatch_job(&self, job: &Job) -> SchedulerResult<ProxyReply>;
    /// Answers `UNKNOWN_JOB` if the worker does not have it.
    async fn cancel_job(&self, uid: &str) -> SchedulerResult<ProxyReply>;
    /// Answers `UNKNOWN_JOB` or `NOT_RUNNING`.
    async fn pause_job(&self, uid: &str) -> SchedulerResult<ProxyReply>;
    /// Answers `UNKNOWN_JOB` or `NOT_PAUSED`.
    async fn resume_job(&self, uid: &str) -> SchedulerResult<ProxyReply>;
}

/// Builds a proxy for a machine.
pub trait ProxyConnector: Send + Sync {
    fn connect(&self, machine: &WorkMachine) -> SchedulerResult<Arc<dyn WorkerProxy>>;
}

// ── Control socket proxy ───────────────────────────────────────────

/// Proxy speaking the worker control protocol. Calls on one proxy are
/// serialized; different proxies run in parallel.
pub struct SocketWorkerProxy {
    machine: MachineUid,
    client: ControlClient,
    lock: tokio::sync::Mutex<()>,
}

impl SocketWorkerProxy {
    pub fn new(machine: MachineUid, client: ControlClient) -> Self {
        Self {
            machine,
            client,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn call(&self, command: WorkerCommand) -> SchedulerResult<ProxyReply> {
        let _serialized = self.lock.lock().await;
        let response = self
            .client
            .send(&command)
            .await
            .map_err(|source| SchedulerError::Transport {
                machine: self.machine.clone(),
                source,
            })?;
        Ok(response.into())
    }
}

#[async_trait]
impl WorkerProxy for SocketWorkerProxy {
    async fn dispatch_job(&self, job: &Job) -> SchedulerResult<ProxyReply> {
        self.call(WorkerCommand::StartJob(StartJobCommand { job: job.clone() }))
            .await
    }

    async fn cancel_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.call(WorkerCommand::CancelJob(KillJobCommand {
            uid: uid.to_string(),
        }))
        .await
    }

    async fn pause_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.call(WorkerCommand::PauseJob(PauseJobCommand {
            uid: uid.to_string(),
        }))
        .await
    }

    async fn resume_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.call(WorkerCommand::ResumeJob(ResumeJobCommand {
            uid: uid.to_string(),
        }))
        .await
    }
}

/// Connects through each machine's advertised [`SshConfig`](jobcenter_core::SshConfig).
pub struct SocketConnector {
    username: String,
    timeout: Duration,
}

impl SocketConnector {
    /// `username` must be in the workers' admin group.
    pub fn new(username: impl Into<String>, timeout: Duration) -> Self {
        Self {
            username: username.into(),
            timeout,
        }
    }
}

impl ProxyConnector for SocketConnector {
    fn connect(&self, machine: &WorkMachine) -> SchedulerResult<Arc<dyn WorkerProxy>> {
        let connection = machine
            .connection
            .as_ref()
            .ok_or_else(|| SchedulerError::NoConnection(machine.uid.clone()))?;
        let client = ControlClient::from_config(connection)
            .with_username(self.username.clone())
            .with_timeout(self.timeout);
        Ok(Arc::new(SocketWorkerProxy::new(machine.uid.clone(), client)))
    }
}

// ── Factory ────────────────────────────────────────────────────────

#[derive(Default)]
struct FactoryState {
    proxies: HashMap<MachineUid, Arc<dyn WorkerProxy>>,
    failures: HashMap<MachineUid, u32>,
}

/// Caches one proxy per machine and counts consecutive transport failures.
pub struct ProxyFactory {
    connector: Arc<dyn ProxyConnector>,
    max_failures: u32,
    state: Mutex<FactoryState>,
}

impl ProxyFactory {
    pub fn new(connector: Arc<dyn ProxyConnector>, max_failures: u32) -> Self {
        Self {
            connector,
            max_failures: max_failures.max(1),
            state: Mutex::new(FactoryState::default()),
        }
    }

    pub fn proxy(&self, machine: &WorkMachine) -> SchedulerResult<Arc<dyn WorkerProxy>> {
        if let Some(proxy) = self.state.lock().proxies.get(&machine.uid) {
            return Ok(proxy.clone());
        }
        let proxy = self.connector.connect(machine)?;
        debug!(machine = %machine.uid, "worker proxy created");
        self.state
            .lock()
            .proxies
            .insert(machine.uid.clone(), proxy.clone());
        Ok(proxy)
    }

    pub fn report_success(&self, machine: &str) {
        self.state.lock().failures.remove(machine);
    }

    /// Count a transport failure and drop the cached proxy so the next
    /// command reconnects. True once the machine reached the failure limit.
    pub fn report_failure(&self, machine: &str) -> bool {
        let mut state = self.state.lock();
        state.proxies.remove(machine);
        let count = state.failures.entry(machine.to_string()).or_insert(0);
        *count += 1;
        warn!(%machine, failures = *count, limit = self.max_failures, "worker transport failure");
        *count >= self.max_failures
    }

    pub fn failures(&self, machine: &str) -> u32 {
        self.state.lock().failures.get(machine).copied().unwrap_or(0)
    }

    pub fn invalidate(&self, machine: &str) {
        let mut state = self.state.lock();
        state.proxies.remove(machine);
        state.failures.remove(machine);
    }
}
