//! Worker daemon assembly.
//!
//! Startup order matters: the exit stream is subscribed before the control
//! socket accepts `StartJobCommand`, so no container can exit unseen. On
//! the way down the listener is stopped before the reporter, so every exit
//! it forwarded is still sent to the server.

use std::sync::Arc;

use jobcenter_control::{
    CommandSet, ControlClient, ControlServer, GroupAuthorizer, RegisterWorkMachineCommand,
    ServerCommand, UnregisterWorkMachineCommand,
};
use jobcenter_core::{MachineUid, WorkerConfig};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::handler::WorkerHandler;
use crate::lifecycle::{ReportRetry, Reporter, ServerReporter, spawn_listener, spawn_reporter};
use crate::resources;
use crate::runtime::ContainerRuntime;

pub struct WorkerDaemon {
    config: WorkerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    server: ControlClient,
    report_retry: ReportRetry,
    trust_claimed_usernames: bool,
}

impl WorkerDaemon {
    pub fn new(config: WorkerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let server = ControlClient::from_config(&config.server);
        Self {
            config,
            runtime,
            server,
            report_retry: ReportRetry::default(),
            trust_claimed_usernames: false,
        }
    }

    pub fn with_report_retry(mut self, retry: ReportRetry) -> Self {
        self.report_retry = retry;
        self
    }

    pub fn trust_claimed_usernames(mut self, trust: bool) -> Self {
        self.trust_claimed_usernames = trust;
        self
    }

    async fn send(&self, command: ServerCommand) -> WorkerResult<Option<String>> {
        let response = self.server.send(&command).await?;
        if !response.is_success {
            return Err(WorkerError::Rejected {
                command: command.type_name(),
                code: response.error,
                message: response.result_string,
            });
        }
        Ok(response.uid)
    }

    async fn register(&self) -> WorkerResult<MachineUid> {
        let resources = resources::detect(&self.config);
        let command = ServerCommand::RegisterWorkMachine(RegisterWorkMachineCommand {
            uid: self.config.uid.clone(),
            resources,
            connection: Some(self.config.advertised_connection()),
        });
        let uid = self
            .send(command)
            .await?
            .or_else(|| self.config.uid.clone())
            .ok_or_else(|| WorkerError::Rejected {
                command: "RegisterWorkMachineCommand",
                code: None,
                message: "no machine uid assigned".to_string(),
            })?;
        info!(machine = %uid, %resources, "registered with server");
        Ok(uid)
    }

    /// Register, serve commands until `KillCommand` or `shutdown`, then
    /// unregister and wait for running containers to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let exits = self.runtime.events().await?;
        let (events_tx, events_rx) = mpsc::channel(64);
        let handler = WorkerHandler::new(self.runtime.clone(), events_tx.clone());
        let control = ControlServer::bind(
            &self.config.control_socket,
            GroupAuthorizer::new(self.config.admin_group.clone()),
        )?
        .trust_claimed_usernames(self.trust_claimed_usernames);

        let machine = self.register().await?;

        let (stop_listener, listener_rx) = watch::channel(false);
        let (stop_reporter, reporter_rx) = watch::channel(false);
        let listener = spawn_listener(handler.clone(), exits, events_tx, listener_rx);
        let reporter: Arc<dyn Reporter> = Arc::new(ServerReporter::new(self.server.clone()));
        let reporting = spawn_reporter(reporter, events_rx, self.report_retry, reporter_rx);

        control.serve(handler.clone(), shutdown).await?;

        let unregister = ServerCommand::UnregisterWorkMachine(UnregisterWorkMachineCommand {
            uid: machine.clone(),
            force: false,
        });
        if let Err(e) = self.send(unregister).await {
            warn!(machine = %machine, error = %e, "unregister failed");
        }

        let remaining = handler.active_jobs();
        if remaining > 0 {
            info!(jobs = remaining, "waiting for running jobs to finish");
        }
        handler.wait_drained().await;
        let _ = stop_listener.send(true);
        let _ = listener.await;
        let _ = stop_reporter.send(true);
        let _ = reporting.await;
        info!(machine = %machine, "worker stopped");
        Ok(())
    }
}
