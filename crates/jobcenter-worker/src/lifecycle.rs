//! Container exits and their reports to the server.
//!
//! ```text
//! runtime.events() ──ContainerExit──► listener ──LifecycleEvent──► reporter ──► server socket
//!                                        │                            ▲
//!                                        │          WorkerHandler ────┘ start failures
//!                                        └── WorkerHandler::on_exit, runtime.remove
//! ```
//!
//! A report the server could not take is retried with a doubling delay
//! until it is accepted or refused for good. Once the reporter is told to
//! stop, each pending report gets a single attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_control::{
    CommandSet, ControlClient, JobCrashedCommand, JobFinishedCommand, ServerCommand,
};
use jobcenter_core::JobUid;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::handler::{ExitDisposition, WorkerHandler};
use crate::runtime::ContainerExit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Finished(JobUid),
    Crashed { uid: JobUid, exit_code: i64 },
    /// The job's image or container never came up.
    Failed { uid: JobUid, reason: String },
}

impl LifecycleEvent {
    pub fn uid(&self) -> &str {
        match self {
            LifecycleEvent::Finished(uid)
            | LifecycleEvent::Crashed { uid, .. }
            | LifecycleEvent::Failed { uid, .. } => uid,
        }
    }

    pub fn to_command(&self) -> ServerCommand {
        match self {
            LifecycleEvent::Finished(uid) => {
                ServerCommand::JobFinished(JobFinishedCommand { uid: uid.clone() })
            }
            LifecycleEvent::Crashed { uid, .. } | LifecycleEvent::Failed { uid, .. } => {
                ServerCommand::JobCrashed(JobCrashedCommand { uid: uid.clone() })
            }
        }
    }
}

#[async_trait]
pub trait Reporter: Send + Sync + 'static {
    async fn report(&self, event: &LifecycleEvent) -> WorkerResult<()>;
}

/// Reports over the server's control socket.
pub struct ServerReporter {
    client: ControlClient,
}

impl ServerReporter {
    pub fn new(client: ControlClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Reporter for ServerReporter {
    async fn report(&self, event: &LifecycleEvent) -> WorkerResult<()> {
        let command = event.to_command();
        let response = self.client.send(&command).await?;
        if !response.is_success {
            return Err(WorkerError::Rejected {
                command: command.type_name(),
                code: response.error,
                message: response.result_string,
            });
        }
        Ok(())
    }
}

/// Delay between attempts to deliver one report.
#[derive(Debug, Clone, Copy)]
pub struct ReportRetry {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReportRetry {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Turn container exits into lifecycle events until `exits` closes or
/// `shutdown` fires. An exit already taken off the channel is always
/// forwarded before stopping. Exits of containers this worker did not
/// start are ignored and the containers are left alone.
pub fn spawn_listener(
    handler: Arc<WorkerHandler>,
    mut exits: mpsc::Receiver<ContainerExit>,
    events: mpsc::Sender<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let exit = tokio::select! {
                biased;
                exit = exits.recv() => match exit {
                    Some(exit) => exit,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let disposition = handler.on_exit(&exit);
            if !disposition.is_ours() {
                debug!(container = %exit.container, "exit of foreign container ignored");
                continue;
            }
            if let Err(e) = handler.runtime().remove(&exit.container).await {
                debug!(container = %exit.container, error = %e, "container removal failed");
            }
            let ExitDisposition::Report(event) = disposition else {
                debug!(container = %exit.container, "exit of cancelled job not reported");
                continue;
            };
            info!(job = %event.uid(), ?event, "job exited");
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}

/// Send every event to the server until the channel closes or `shutdown`
/// fires; events already queued at shutdown are still attempted once.
pub fn spawn_reporter(
    reporter: Arc<dyn Reporter>,
    mut events: mpsc::Receiver<LifecycleEvent>,
    retry: ReportRetry,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = stopped(&mut shutdown) => break,
            };
            deliver(reporter.as_ref(), &event, retry, &mut shutdown).await;
        }
        while let Ok(event) = events.try_recv() {
            deliver(reporter.as_ref(), &event, retry, &mut shutdown).await;
        }
    })
}

async fn deliver(
    reporter: &dyn Reporter,
    event: &LifecycleEvent,
    retry: ReportRetry,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut delay = retry.initial;
    loop {
        let e = match reporter.report(event).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if e.is_final() {
            warn!(job = %event.uid(), error = %e, "exit report refused; dropping it");
            return;
        }
        if stopping(shutdown) {
            warn!(job = %event.uid(), error = %e, "exit report failed while stopping; dropping it");
            return;
        }
        warn!(job = %event.uid(), error = %e, retry_in = ?delay, "exit report failed");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(shutdown) => {}
        }
        delay = (delay * 2).min(retry.max);
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
