//! Server assembly.
//!
//! Wires the database, the scheduler driver, the control socket and the
//! optional statistics API together, and tears them down in reverse order
//! once a `KillCommand` arrives or the caller's shutdown fires.

use std::sync::Arc;
use std::time::Duration;

use jobcenter_control::{ControlServer, GroupAuthorizer, current_username};
use jobcenter_core::ServerConfig;
use jobcenter_placement::PriorityAgingCost;
use jobcenter_scheduler::{
    Dispatcher, DriverConfig, ProxyConnector, ProxyFactory, SchedulerDriver, SchedulingAlgorithm,
    SocketConnector,
};
use jobcenter_state::Database;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{ServerError, ServerResult};
use crate::handler::ServerHandler;
use crate::notifier::LogNotifier;

pub struct JobCenter {
    config: ServerConfig,
    db: Database,
    trust_claimed_usernames: bool,
}

impl JobCenter {
    /// Open the database named by `config` (in memory when it names none).
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        let db = Database::from_config(config.database_config.path.as_deref())?;
        Ok(Self::new(config, db))
    }

    pub fn new(config: ServerConfig, db: Database) -> Self {
        Self {
            config,
            db,
            trust_claimed_usernames: false,
        }
    }

    /// See [`ControlServer::trust_claimed_usernames`].
    pub fn trust_claimed_usernames(mut self, trust: bool) -> Self {
        self.trust_claimed_usernames = trust;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Reach workers over their advertised connections as the current user.
    pub fn socket_connector(&self) -> Arc<dyn ProxyConnector> {
        Arc::new(SocketConnector::new(
            current_username(),
            Duration::from_secs(self.config.command_timeout_secs),
        ))
    }

    /// Serve until a `KillCommand` is handled or `shutdown` fires.
    pub async fn run(
        self,
        connector: Arc<dyn ProxyConnector>,
        shutdown: watch::Receiver<bool>,
    ) -> ServerResult<()> {
        let config = &self.config;
        let control = ControlServer::bind(
            &config.control_socket,
            GroupAuthorizer::new(config.admin_group.clone()),
        )?
        .trust_claimed_usernames(self.trust_claimed_usernames);
        let socket = control.path().to_path_buf();

        self.db.subscribe_status(Arc::new(LogNotifier));

        // ── Scheduler ──────────────────────────────────────────────

        let driver_config = DriverConfig::from_server_config(config);
        let algorithm = SchedulingAlgorithm::new(
            Arc::new(PriorityAgingCost::default()),
            driver_config.algorithm,
        );
        let factory = Arc::new(ProxyFactory::new(connector, config.max_worker_failures));
        let dispatcher = Dispatcher::new(
            factory,
            Duration::from_secs(config.command_timeout_secs),
        );
        let driver = SchedulerDriver::new(self.db.clone(), algorithm, dispatcher, driver_config);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut driver_handle = tokio::spawn(driver.run(stop_rx.clone()));

        // ── Statistics API ─────────────────────────────────────────

        let api_handle = (config.web_server_port > 0).then(|| {
            tokio::spawn(jobcenter_api::serve(
                self.db.clone(),
                config.web_server_port,
                stop_rx.clone(),
            ))
        });

        // ── Control socket ─────────────────────────────────────────

        info!(socket = %socket.display(), "JobCenter server running");
        let handler = Arc::new(ServerHandler::new(self.db.clone()));
        let mut driver_joined = false;
        let outcome = tokio::select! {
            served = control.serve(handler, shutdown) => served.map_err(ServerError::from),
            finished = &mut driver_handle => {
                driver_joined = true;
                let _ = std::fs::remove_file(&socket);
                match finished? {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!(error = %e, "scheduler stopped");
                        Err(e.into())
                    }
                }
            }
        };

        let _ = stop_tx.send(true);
        if !driver_joined {
            driver_handle.await??;
        }
        if let Some(handle) = api_handle {
            handle.await?.map_err(ServerError::Api)?;
        }
        info!("JobCenter server stopped");
        outcome
    }
}
