//! Server-side command handlers.
//!
//! | command | who | effect |
//! |---|---|---|
//! | `AddJobCommand` | anyone | queue a job owned by the caller |
//! | `CancelJobCommand` | owner or admin | cancel by uid or label |
//! | `QueryJobCommand` | anyone | the entry as YAML |
//! | `RegisterWorkMachineCommand` | admin | add or re-online a machine |
//! | `UnregisterWorkMachineCommand` | admin | retire or take offline |
//! | `JobFinishedCommand` / `JobCrashedCommand` | admin | record a container exit |
//! | `KillCommand` | admin | stop the server |

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use jobcenter_control::{
    AddJobCommand, Caller, CommandHandler, JobSelector, RegisterWorkMachineCommand, Response,
    ServerCommand, UnregisterWorkMachineCommand,
};
use jobcenter_core::{DatabaseJobEntry, ErrorKind};
use jobcenter_state::{Database, StateError};
use tracing::{info, warn};

pub struct ServerHandler {
    db: Database,
    running: AtomicBool,
}

fn failure(e: StateError) -> Response {
    Response::error(e.kind(), e.to_string())
}

impl ServerHandler {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Look a job up by uid, or by label among the caller's jobs.
    fn resolve(&self, caller: &Caller, selector: &JobSelector) -> Result<DatabaseJobEntry, Response> {
        if let Err(e) = selector.validate() {
            return Err(Response::error(e.kind(), e.to_string()));
        }
        let found = match (&selector.uid, &selector.label) {
            (Some(uid), _) => self.db.job(uid),
            (None, Some(label)) => self.db.job_by_label(&caller.username, label),
            (None, None) => None,
        };
        found.ok_or_else(|| {
            let what = selector
                .uid
                .as_deref()
                .or(selector.label.as_deref())
                .unwrap_or_default();
            Response::error(ErrorKind::NotFound, format!("no job {what}"))
        })
    }

    fn add_job(&self, caller: &Caller, command: AddJobCommand) -> Response {
        let mut job = command.job;
        job.owner_id = caller.username.clone();
        match self.db.add_job(job) {
            Ok(uid) => Response::ok_with_uid(format!("job {uid} queued"), uid),
            Err(e) => failure(e),
        }
    }

    fn cancel_job(&self, caller: &Caller, selector: &JobSelector) -> Response {
        let entry = match self.resolve(caller, selector) {
            Ok(entry) => entry,
            Err(response) => return response,
        };
        if entry.job.owner_id != caller.username && !caller.is_admin {
            return Response::error(
                ErrorKind::Permission,
                format!("job {} belongs to {}", entry.job.uid, entry.job.owner_id),
            );
        }
        let status = entry.status();
        if status.is_terminal() {
            return Response::error(
                ErrorKind::Validation,
                format!("job {} is already {status}", entry.job.uid),
            );
        }
        match self.db.cancel_job(&entry.job.uid) {
            Ok(cancelled) => {
                info!(job = %cancelled.job.uid, by = %caller.username, "job cancelled");
                Response::ok_with_uid(
                    format!("job {} cancelled", cancelled.job.uid),
                    cancelled.job.uid,
                )
            }
            Err(e) => failure(e),
        }
    }

    fn query_job(&self, caller: &Caller, selector: &JobSelector) -> Response {
        let entry = match self.resolve(caller, selector) {
            Ok(entry) => entry,
            Err(response) => return response,
        };
        match serde_yaml::to_string(&entry) {
            Ok(yaml) => Response::ok_with_uid(yaml, entry.job.uid),
            Err(e) => Response::error(ErrorKind::Validation, e.to_string()),
        }
    }

    fn register(&self, command: RegisterWorkMachineCommand) -> Response {
        match self
            .db
            .register_work_machine(command.uid, command.resources, command.connection)
        {
            Ok(uid) => Response::ok_with_uid(format!("work machine {uid} online"), uid),
            Err(e) => failure(e),
        }
    }

    fn unregister(&self, command: UnregisterWorkMachineCommand) -> Response {
        match self.db.unregister_work_machine(&command.uid, command.force) {
            Ok(state) => Response::ok_with_uid(
                format!("work machine {} is {state}", command.uid),
                command.uid,
            ),
            Err(e) => failure(e),
        }
    }

    fn job_exited(&self, uid: &str, crashed: bool) -> Response {
        match self.db.finish_job(uid, crashed) {
            Ok(()) => {
                let outcome = if crashed { "crashed" } else { "finished" };
                Response::ok_with_uid(format!("job {uid} {outcome}"), uid)
            }
            Err(e) => {
                warn!(job = %uid, error = %e, "exit report rejected");
                failure(e)
            }
        }
    }
}

#[async_trait]
impl CommandHandler for ServerHandler {
    type Command = ServerCommand;

    async fn handle(&self, caller: &Caller, command: ServerCommand) -> Response {
        match command {
            ServerCommand::AddJob(c) => self.add_job(caller, c),
            ServerCommand::CancelJob(c) => self.cancel_job(caller, &c.selector),
            ServerCommand::QueryJob(c) => self.query_job(caller, &c.selector),
            ServerCommand::RegisterWorkMachine(c) => self.register(c),
            ServerCommand::UnregisterWorkMachine(c) => self.unregister(c),
            ServerCommand::JobFinished(c) => self.job_exited(&c.uid, false),
            ServerCommand::JobCrashed(c) => self.job_exited(&c.uid, true),
            ServerCommand::Kill(_) => {
                info!(by = %caller.username, "kill requested");
                self.stop();
                Response::ok("server shutting down")
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
