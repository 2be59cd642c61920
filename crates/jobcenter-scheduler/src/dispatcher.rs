//! Dispatch delta engine.
//!
//! Remembers the last status each job was driven to and, given a new
//! distribution, sends each worker exactly the commands needed to get there:
//!
//! | from \ to          | RUNNING      | PAUSED    | CANCELLED  | QUEUED |
//! |--------------------|--------------|-----------|------------|--------|
//! | (absent) / QUEUED  | dispatch_job | -         | cancel_job | -      |
//! | RUNNING            | -            | pause_job | cancel_job | -      |
//! | PAUSED             | resume_job   | -         | cancel_job | -      |
//!
//! A command whose reply says the job is already in the target state counts
//! as delivered. A failed command leaves `last_status` alone so the next
//! call sends it again. A job preempted before it ever started stays
//! unrecorded, so resuming it becomes a fresh `dispatch_job`. A worker
//! answering `UNKNOWN_JOB` to a pause or resume no longer has the job; it
//! is reported as lost.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use jobcenter_core::{
    DatabaseJobEntry, ErrorCode, Job, JobStatus, JobUid, MachineUid, WorkMachine,
};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::proxy::{ProxyFactory, ProxyReply, WorkerProxy};

#[derive(Debug, Clone)]
enum Action {
    Dispatch(Box<Job>),
    Pause,
    Resume,
    Cancel,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Dispatch(_) => "dispatch_job",
            Action::Pause => "pause_job",
            Action::Resume => "resume_job",
            Action::Cancel => "cancel_job",
        }
    }

    /// Replies meaning the worker is already where we want it.
    fn already_done(&self, code: ErrorCode) -> bool {
        matches!(
            (self, code),
            (Action::Dispatch(_), ErrorCode::Duplicate)
                | (Action::Cancel, ErrorCode::UnknownJob)
                | (Action::Pause, ErrorCode::NotRunning)
                | (Action::Resume, ErrorCode::NotPaused)
        )
    }

    /// Replies meaning the worker has no trace of the job.
    fn lost(&self, code: ErrorCode) -> bool {
        matches!(self, Action::Pause | Action::Resume) && code == ErrorCode::UnknownJob
    }

    async fn send(&self, proxy: &dyn WorkerProxy, uid: &str) -> SchedulerResult<ProxyReply> {
        match self {
            Action::Dispatch(job) => proxy.dispatch_job(job).await,
            Action::Pause => proxy.pause_job(uid).await,
            Action::Resume => proxy.resume_job(uid).await,
            Action::Cancel => proxy.cancel_job(uid).await,
        }
    }
}

/// Command needed to move a job from `from` to `to`, `Ok(None)` if none.
fn plan(from: JobStatus, to: JobStatus, entry: &DatabaseJobEntry) -> Result<Option<Action>, ()> {
    use JobStatus::*;
    match (from, to) {
        (Queued, Running) => Ok(Some(Action::Dispatch(Box::new(entry.job.clone())))),
        (Running, Paused) => Ok(Some(Action::Pause)),
        (Paused, Running) => Ok(Some(Action::Resume)),
        (Queued | Running | Paused, Cancelled) => Ok(Some(Action::Cancel)),
        (Queued | Running | Paused, Queued | Running | Paused) => Ok(None),
        _ => Err(()),
    }
}

/// What one dispatch call did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Delivered commands as `(job, command)`.
    pub sent: Vec<(JobUid, &'static str)>,
    /// Jobs whose command failed; retried on the next call.
    pub failed: Vec<JobUid>,
    /// Cancellations the worker acknowledged.
    pub cancelled: Vec<JobUid>,
    /// Jobs the worker could not start.
    pub crashed: Vec<JobUid>,
    /// Jobs the worker no longer has; to be requeued.
    pub lost: Vec<JobUid>,
    /// Machines that reached the transport failure limit.
    pub offline_machines: Vec<MachineUid>,
    pub violations: Vec<SchedulerError>,
}

impl DispatchReport {
    pub fn needs_retry(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
            && self.failed.is_empty()
            && self.crashed.is_empty()
            && self.lost.is_empty()
            && self.violations.is_empty()
    }
}

pub struct Dispatcher {
    factory: Arc<ProxyFactory>,
    timeout: Duration,
    last_status: HashMap<JobUid, JobStatus>,
}

struct Pending {
    uid: JobUid,
    machine: MachineUid,
    target: JobStatus,
    action: Action,
    proxy: Option<Arc<dyn WorkerProxy>>,
}

impl Dispatcher {
    pub fn new(factory: Arc<ProxyFactory>, timeout: Duration) -> Self {
        Self {
            factory,
            timeout,
            last_status: HashMap::new(),
        }
    }

    pub fn factory(&self) -> &Arc<ProxyFactory> {
        &self.factory
    }

    pub fn last_status(&self, uid: &str) -> Option<JobStatus> {
        self.last_status.get(uid).copied()
    }

    /// Drive workers toward `entries`. At most one command per job.
    pub async fn dispatch(
        &mut self,
        entries: &[DatabaseJobEntry],
        machines: &[WorkMachine],
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let present: BTreeSet<&str> = entries.iter().map(|e| e.uid()).collect();
        self.last_status.retain(|uid, _| present.contains(uid.as_str()));

        let machines: HashMap<&str, &WorkMachine> =
            machines.iter().map(|m| (m.uid.as_str(), m)).collect();
        let mut pending = Vec::new();

        for entry in entries {
            let uid = entry.uid();
            let to = entry.status();
            let Some(machine_uid) = entry.assigned_machine.as_deref() else {
                self.last_status.remove(uid);
                continue;
            };
            let Some(machine) = machines
                .get(machine_uid)
                .filter(|m| m.state.is_reachable())
            else {
                debug!(job = %uid, machine = %machine_uid, "machine unreachable; nothing sent");
                continue;
            };
            let from = self.last_status(uid).unwrap_or(JobStatus::Queued);
            let action = match plan(from, to, entry) {
                Ok(Some(action)) => action,
                Ok(None) => {
                    if from != JobStatus::Queued {
                        self.record(uid, to);
                    }
                    continue;
                }
                Err(()) => {
                    error!(job = %uid, %from, %to, "no dispatch rule for transition");
                    report.violations.push(SchedulerError::Violation {
                        uid: uid.to_string(),
                        from,
                        to,
                    });
                    continue;
                }
            };
            let proxy = match self.factory.proxy(machine) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!(machine = %machine_uid, error = %e, "no proxy for worker");
                    None
                }
            };
            pending.push(Pending {
                uid: uid.to_string(),
                machine: machine_uid.to_string(),
                target: to,
                action,
                proxy,
            });
        }

        let timeout = self.timeout;
        let results = join_all(pending.iter().map(|p| async move {
            let Some(proxy) = p.proxy.as_deref() else {
                return None;
            };
            match tokio::time::timeout(timeout, p.action.send(proxy, &p.uid)).await {
                Ok(Ok(reply)) => Some(reply),
                Ok(Err(e)) => {
                    warn!(job = %p.uid, machine = %p.machine, command = p.action.name(), error = %e, "command failed");
                    None
                }
                Err(_) => {
                    warn!(job = %p.uid, machine = %p.machine, command = p.action.name(), ?timeout, "command timed out");
                    None
                }
            }
        }))
        .await;

        let mut offline = BTreeSet::new();
        for (p, result) in pending.into_iter().zip(results) {
            let Some(reply) = result else {
                report.failed.push(p.uid);
                if self.factory.report_failure(&p.machine) {
                    offline.insert(p.machine);
                }
                continue;
            };
            self.factory.report_success(&p.machine);

            let delivered = reply.ok || reply.code.is_some_and(|c| p.action.already_done(c));
            if delivered {
                info!(job = %p.uid, machine = %p.machine, command = p.action.name(), "command delivered");
                report.sent.push((p.uid.clone(), p.action.name()));
                self.record(&p.uid, p.target);
                if matches!(p.action, Action::Cancel) {
                    report.cancelled.push(p.uid);
                }
            } else if matches!(p.action, Action::Dispatch(_)) && reply.code == Some(ErrorCode::Runtime) {
                warn!(job = %p.uid, machine = %p.machine, reason = %reply.message, "worker could not start job");
                self.last_status.remove(&p.uid);
                report.crashed.push(p.uid);
            } else if reply.code.is_some_and(|c| p.action.lost(c)) {
                warn!(job = %p.uid, machine = %p.machine, command = p.action.name(), "worker no longer has job");
                self.last_status.remove(&p.uid);
                report.lost.push(p.uid);
            } else {
                warn!(job = %p.uid, machine = %p.machine, command = p.action.name(), code = ?reply.code, reason = %reply.message, "command refused");
                report.failed.push(p.uid);
            }
        }
        report.offline_machines = offline.into_iter().collect();
        report
    }

    fn record(&mut self, uid: &str, status: JobStatus) {
        if status == JobStatus::Cancelled {
            self.last_status.remove(uid);
        } else {
            self.last_status.insert(uid.to_string(), status);
        }
    }
}
