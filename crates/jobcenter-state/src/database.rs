//! Database facade: the single owner of job entries and work machines.
//!
//! Tables live in memory behind a read-write lock and every committed change
//! is written through to the redb [`StateStore`]. Writers go through
//! [`Database::atomic_update`], which holds the write lock for the whole
//! closure, validates status transitions, and maintains statistics.
//!
//! After a commit (and after the lock is released) every registered
//! [`StatusSink`] sees one call per status transition, then every
//! [`UpdateSink`] sees one call. Writes issued from inside a callback are
//! folded into the outermost notification: they still produce their status
//! callbacks, but the update callback fires once when the outermost
//! notification finishes.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use jobcenter_core::{
    DatabaseJobEntry, Job, JobStatus, JobUid, MachineUid, ResourceAllocation, SshConfig,
    WorkMachine, WorkMachineResources, WorkMachineState,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{StateError, StateResult};
use crate::store::StateStore;

/// Receives a call after every committed write.
pub trait UpdateSink: Send + Sync {
    fn on_update(&self);
}

/// Receives a call for every committed job status transition.
pub trait StatusSink: Send + Sync {
    fn on_status_change(&self, entry: &DatabaseJobEntry, from: JobStatus, to: JobStatus);
}

// ── Re-entrancy guard ──────────────────────────────────────────────

thread_local! {
    static NOTIFY_DEPTH: Cell<u32> = const { Cell::new(0) };
    static UPDATE_PENDING: Cell<bool> = const { Cell::new(false) };
}

struct NotifyGuard;

impl NotifyGuard {
    fn enter() -> (Self, bool) {
        let outermost = NOTIFY_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth == 0
        });
        (NotifyGuard, outermost)
    }
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFY_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

// ── Tables & transactions ──────────────────────────────────────────

#[derive(Debug, Default)]
struct Tables {
    jobs: BTreeMap<JobUid, DatabaseJobEntry>,
    machines: BTreeMap<MachineUid, WorkMachine>,
}

/// A committed status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub uid: JobUid,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Staged view over the tables inside [`Database::atomic_update`].
///
/// Reads see staged writes first. Nothing becomes visible to other readers
/// until the closure returns `Ok` and the batch is persisted.
pub struct Transaction<'a> {
    committed: &'a Tables,
    jobs: BTreeMap<JobUid, DatabaseJobEntry>,
    machines: BTreeMap<MachineUid, WorkMachine>,
    transitions: Vec<Transition>,
    now: u64,
}

impl<'a> Transaction<'a> {
    fn new(committed: &'a Tables, now: u64) -> Self {
        Self {
            committed,
            jobs: BTreeMap::new(),
            machines: BTreeMap::new(),
            transitions: Vec::new(),
            now,
        }
    }

    /// Epoch seconds at which the transaction started.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn job(&self, uid: &str) -> Option<&DatabaseJobEntry> {
        self.jobs.get(uid).or_else(|| self.committed.jobs.get(uid))
    }

    /// All jobs, staged versions taking precedence.
    pub fn jobs(&self) -> Vec<&DatabaseJobEntry> {
        let mut merged: BTreeMap<&str, &DatabaseJobEntry> = self
            .committed
            .jobs
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        for (k, v) in &self.jobs {
            merged.insert(k.as_str(), v);
        }
        merged.into_values().collect()
    }

    pub fn machine(&self, uid: &str) -> Option<&WorkMachine> {
        self.machines
            .get(uid)
            .or_else(|| self.committed.machines.get(uid))
    }

    pub fn machines(&self) -> Vec<&WorkMachine> {
        let mut merged: BTreeMap<&str, &WorkMachine> = self
            .committed
            .machines
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        for (k, v) in &self.machines {
            merged.insert(k.as_str(), v);
        }
        merged.into_values().collect()
    }

    /// Stage a brand new entry. Fails if the uid is taken.
    pub fn insert_job(&mut self, entry: DatabaseJobEntry) -> StateResult<()> {
        if entry.uid().is_empty() {
            return Err(StateError::Validation("job uid must not be empty".to_string()));
        }
        if self.job(entry.uid()).is_some() {
            return Err(StateError::Validation(format!(
                "job {} already exists",
                entry.uid()
            )));
        }
        self.jobs.insert(entry.job.uid.clone(), entry);
        Ok(())
    }

    /// Stage an updated entry.
    ///
    /// A status change is validated against the lifecycle state machine and
    /// recorded in the entry's statistics. Statistics passed in are ignored:
    /// the database owns them.
    pub fn put_job(&mut self, mut entry: DatabaseJobEntry) -> StateResult<()> {
        let prev = self
            .job(entry.uid())
            .ok_or_else(|| StateError::NotFound(format!("job {}", entry.uid())))?;
        let (from, to) = (prev.status(), entry.status());
        entry.statistics = prev.statistics;
        if from != to {
            if !from.can_transition_to(to) {
                return Err(StateError::InvalidTransition {
                    uid: entry.job.uid.clone(),
                    from,
                    to,
                });
            }
            entry.statistics.record_transition(from, to, self.now);
            self.transitions.push(Transition {
                uid: entry.job.uid.clone(),
                from,
                to,
            });
        }
        self.jobs.insert(entry.job.uid.clone(), entry);
        Ok(())
    }

    /// Change only the status of an entry.
    pub fn set_job_status(&mut self, uid: &str, to: JobStatus) -> StateResult<()> {
        let mut entry = self
            .job(uid)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("job {uid}")))?;
        entry.job.status = to;
        self.put_job(entry)
    }

    pub fn put_machine(&mut self, machine: WorkMachine) {
        self.machines.insert(machine.uid.clone(), machine);
    }

    /// Give `resources` back to the machine's free pool, if it tracks one.
    pub fn deallocate_on(&mut self, machine_uid: &str, resources: ResourceAllocation) {
        if resources.is_zero() {
            return;
        }
        let Some(mut machine) = self.machine(machine_uid).cloned() else {
            return;
        };
        if let Some(res) = machine.resources.as_mut() {
            if !res.deallocate(resources) {
                warn!(machine = %machine_uid, %resources, "deallocation would exceed total; ignored");
                return;
            }
        }
        self.put_machine(machine);
    }

    /// Whether any entry still occupies `machine_uid`.
    pub fn machine_has_jobs(&self, machine_uid: &str) -> bool {
        self.jobs()
            .iter()
            .any(|e| e.assigned_machine.as_deref() == Some(machine_uid))
    }

    /// A `RETIRED` machine with nothing left on it goes `OFFLINE`.
    pub fn retire_if_idle(&mut self, machine_uid: &str) {
        let Some(machine) = self.machine(machine_uid) else {
            return;
        };
        if machine.state == WorkMachineState::Retired && !self.machine_has_jobs(machine_uid) {
            let mut machine = machine.clone();
            machine.state = WorkMachineState::Offline;
            info!(machine = %machine_uid, "retired machine drained; now offline");
            self.put_machine(machine);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.machines.is_empty()
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        self,
    ) -> (
        BTreeMap<JobUid, DatabaseJobEntry>,
        BTreeMap<MachineUid, WorkMachine>,
        Vec<Transition>,
    ) {
        (self.jobs, self.machines, self.transitions)
    }
}

// ── Filters ────────────────────────────────────────────────────────

/// Criteria for [`Database::jobs`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub statuses: Vec<JobStatus>,
    pub machine: Option<MachineUid>,
    pub label: Option<String>,
}

impl JobFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn matches(&self, entry: &DatabaseJobEntry) -> bool {
        self.owner.as_ref().is_none_or(|o| *o == entry.job.owner_id)
            && (self.statuses.is_empty() || self.statuses.contains(&entry.status()))
            && self
                .machine
                .as_ref()
                .is_none_or(|m| entry.assigned_machine.as_ref() == Some(m))
            && self
                .label
                .as_ref()
                .is_none_or(|l| entry.job.label.as_ref() == Some(l))
    }
}

// ── Database ───────────────────────────────────────────────────────

struct Inner {
    tables: RwLock<Tables>,
    store: StateStore,
    clock: Arc<dyn Clock>,
    update_sinks: RwLock<Vec<Arc<dyn UpdateSink>>>,
    status_sinks: RwLock<Vec<Arc<dyn StatusSink>>>,
}

/// Shared handle to the job and work machine tables.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open (or create) a persistent database and reload its contents.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> StateResult<Self> {
        Self::with_store(StateStore::open(path)?, clock)
    }

    /// An empty database on the in-memory redb backend.
    pub fn in_memory(clock: Arc<dyn Clock>) -> StateResult<Self> {
        Self::with_store(StateStore::open_in_memory()?, clock)
    }

    /// Open from `path`, or in memory when `None`, using the wall clock.
    pub fn from_config(path: Option<&Path>) -> StateResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        match path {
            Some(path) => Self::open(path, clock),
            None => Self::in_memory(clock),
        }
    }

    fn with_store(store: StateStore, clock: Arc<dyn Clock>) -> StateResult<Self> {
        let mut tables = Tables::default();
        for entry in store.list_jobs()? {
            tables.jobs.insert(entry.job.uid.clone(), entry);
        }
        for machine in store.list_machines()? {
            tables.machines.insert(machine.uid.clone(), machine);
        }
        debug!(
            jobs = tables.jobs.len(),
            machines = tables.machines.len(),
            "database loaded"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(tables),
                store,
                clock,
                update_sinks: RwLock::new(Vec::new()),
                status_sinks: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    pub fn subscribe_updates(&self, sink: Arc<dyn UpdateSink>) {
        self.inner.update_sinks.write().push(sink);
    }

    pub fn subscribe_status(&self, sink: Arc<dyn StatusSink>) {
        self.inner.status_sinks.write().push(sink);
    }

    /// Run `f` under the exclusive lock and commit its staged writes.
    ///
    /// An `Err` from `f` discards everything it staged.
    pub fn atomic_update<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> StateResult<T>,
    ) -> StateResult<T> {
        let (value, notifications) = {
            let mut tables = self.inner.tables.write();
            let now = self.inner.clock.now();
            let mut txn = Transaction::new(&tables, now);
            let value = f(&mut txn)?;
            if txn.is_empty() {
                return Ok(value);
            }
            let (jobs, machines, transitions) = txn.into_parts();
            self.inner.store.commit(jobs.values(), machines.values())?;
            tables.jobs.extend(jobs);
            tables.machines.extend(machines);
            let notifications: Vec<_> = transitions
                .into_iter()
                .filter_map(|t| tables.jobs.get(&t.uid).map(|e| (e.clone(), t.from, t.to)))
                .collect();
            (value, notifications)
        };
        self.notify(notifications);
        Ok(value)
    }

    fn notify(&self, transitions: Vec<(DatabaseJobEntry, JobStatus, JobStatus)>) {
        let (_guard, outermost) = NotifyGuard::enter();

        let status_sinks = self.inner.status_sinks.read().clone();
        for (entry, from, to) in &transitions {
            for sink in &status_sinks {
                sink.on_status_change(entry, *from, *to);
            }
        }

        UPDATE_PENDING.with(|p| p.set(true));
        if !outermost {
            return;
        }
        let update_sinks = self.inner.update_sinks.read().clone();
        while UPDATE_PENDING.with(|p| p.replace(false)) {
            for sink in &update_sinks {
                sink.on_update();
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Entries the scheduler and dispatcher operate on.
    ///
    /// `QUEUED`, `RUNNING` and `PAUSED` entries, plus `CANCELLED` entries
    /// that still name a machine because the cancellation has not been
    /// delivered to the worker yet.
    pub fn current_schedule(&self) -> Vec<DatabaseJobEntry> {
        self.inner
            .tables
            .read()
            .jobs
            .values()
            .filter(|e| {
                e.status().is_active()
                    || (e.status() == JobStatus::Cancelled && e.assigned_machine.is_some())
            })
            .cloned()
            .collect()
    }

    pub fn work_machines(&self) -> Vec<WorkMachine> {
        self.inner.tables.read().machines.values().cloned().collect()
    }

    pub fn online_machines(&self) -> Vec<WorkMachine> {
        self.inner
            .tables
            .read()
            .machines
            .values()
            .filter(|m| m.is_online())
            .cloned()
            .collect()
    }

    pub fn machine(&self, uid: &str) -> Option<WorkMachine> {
        self.inner.tables.read().machines.get(uid).cloned()
    }

    pub fn jobs(&self, filter: &JobFilter) -> Vec<DatabaseJobEntry> {
        self.inner
            .tables
            .read()
            .jobs
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn job(&self, uid: &str) -> Option<DatabaseJobEntry> {
        self.inner.tables.read().jobs.get(uid).cloned()
    }

    /// Most recently added job of `owner` carrying `label`.
    pub fn job_by_label(&self, owner: &str, label: &str) -> Option<DatabaseJobEntry> {
        let filter = JobFilter {
            owner: Some(owner.to_string()),
            label: Some(label.to_string()),
            ..JobFilter::default()
        };
        self.jobs(&filter)
            .into_iter()
            .max_by_key(|e| e.statistics.time_added)
    }

    pub fn jobs_on_machine(&self, machine_uid: &str) -> Vec<DatabaseJobEntry> {
        self.jobs(&JobFilter {
            machine: Some(machine_uid.to_string()),
            ..JobFilter::default()
        })
    }

    /// Jobs that existed and were unfinished at some point since `since`.
    pub fn jobs_active_since(&self, since: u64) -> Vec<DatabaseJobEntry> {
        self.inner
            .tables
            .read()
            .jobs
            .values()
            .filter(|e| e.statistics.active_since(since))
            .cloned()
            .collect()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Validate and enqueue a job; returns its uid.
    pub fn add_job(&self, mut job: Job) -> StateResult<JobUid> {
        job.validate()
            .map_err(|e| StateError::Validation(e.to_string()))?;
        if job.uid.is_empty() {
            job.uid = jobcenter_core::new_uid();
        }
        job.status = JobStatus::New;
        let uid = job.uid.clone();
        self.atomic_update(|txn| {
            let entry = DatabaseJobEntry::new(job, txn.now());
            txn.insert_job(entry)?;
            txn.set_job_status(&uid, JobStatus::Queued)
        })?;
        info!(job = %uid, "job queued");
        Ok(uid)
    }

    /// Cancel a job that has not finished yet.
    ///
    /// Running and paused jobs give their resources back immediately but
    /// keep their machine until the worker acknowledges the cancellation
    /// (see [`Database::release_cancelled`]).
    pub fn cancel_job(&self, uid: &str) -> StateResult<DatabaseJobEntry> {
        self.atomic_update(|txn| {
            let entry = txn
                .job(uid)
                .cloned()
                .ok_or_else(|| StateError::NotFound(format!("job {uid}")))?;
            let held = entry.held_resources();
            txn.set_job_status(uid, JobStatus::Cancelled)?;
            if let Some(machine) = entry.assigned_machine.as_deref() {
                txn.deallocate_on(machine, held);
                let reachable = txn.machine(machine).is_some_and(|m| m.state.is_reachable());
                if !reachable {
                    clear_machine(txn, uid)?;
                    txn.retire_if_idle(machine);
                }
            }
            txn.job(uid)
                .cloned()
                .ok_or_else(|| StateError::NotFound(format!("job {uid}")))
        })
    }

    /// Record that a job's container exited.
    ///
    /// A paused job whose container died before the pause reached it is
    /// finished through `RUNNING`. Reports for jobs that already ended, or
    /// that were requeued after their worker lost them, are accepted and
    /// ignored.
    pub fn finish_job(&self, uid: &str, crashed: bool) -> StateResult<()> {
        let to = if crashed {
            JobStatus::Crashed
        } else {
            JobStatus::Done
        };
        self.atomic_update(|txn| {
            let entry = txn
                .job(uid)
                .cloned()
                .ok_or_else(|| StateError::NotFound(format!("job {uid}")))?;
            let from = entry.status();
            if from.is_terminal() || from == JobStatus::Queued {
                debug!(job = %uid, status = %from, "stale exit report ignored");
                return Ok(());
            }
            let held = entry.held_resources();
            if from == JobStatus::Paused {
                txn.set_job_status(uid, JobStatus::Running)?;
            }
            txn.set_job_status(uid, to)?;
            if let Some(machine) = entry.assigned_machine.as_deref() {
                txn.deallocate_on(machine, held);
                clear_machine(txn, uid)?;
                txn.retire_if_idle(machine);
            }
            Ok(())
        })
    }

    /// Put a running or paused job back in the queue after its worker
    /// reported it no longer has it. Returns whether anything changed.
    pub fn requeue_job(&self, uid: &str) -> StateResult<bool> {
        let requeued = self.atomic_update(|txn| {
            let entry = txn
                .job(uid)
                .cloned()
                .ok_or_else(|| StateError::NotFound(format!("job {uid}")))?;
            if !matches!(entry.status(), JobStatus::Running | JobStatus::Paused) {
                return Ok(false);
            }
            let held = entry.held_resources();
            txn.set_job_status(uid, JobStatus::Queued)?;
            if let Some(machine) = entry.assigned_machine.as_deref() {
                txn.deallocate_on(machine, held);
                clear_machine(txn, uid)?;
                txn.retire_if_idle(machine);
            }
            Ok(true)
        })?;
        if requeued {
            info!(job = %uid, "job lost by its worker; requeued");
        }
        Ok(requeued)
    }

    /// Drop the machine of a cancelled entry once the worker let go of it.
    pub fn release_cancelled(&self, uid: &str) -> StateResult<()> {
        self.atomic_update(|txn| {
            let Some(entry) = txn.job(uid) else {
                return Err(StateError::NotFound(format!("job {uid}")));
            };
            if entry.status() != JobStatus::Cancelled {
                return Ok(());
            }
            let Some(machine) = entry.assigned_machine.clone() else {
                return Ok(());
            };
            clear_machine(txn, uid)?;
            txn.retire_if_idle(&machine);
            Ok(())
        })
    }

    /// Add a work machine, or bring a known one back `ONLINE`.
    ///
    /// A returning machine's free pool is recomputed from the entries that
    /// still hold resources on it.
    pub fn register_work_machine(
        &self,
        uid: Option<MachineUid>,
        total: ResourceAllocation,
        connection: Option<SshConfig>,
    ) -> StateResult<MachineUid> {
        if total.is_negative() {
            return Err(StateError::Validation(format!(
                "negative machine resources: {total}"
            )));
        }
        let uid = uid
            .filter(|u| !u.is_empty())
            .unwrap_or_else(jobcenter_core::new_uid);
        self.atomic_update(|txn| {
            let held: ResourceAllocation = txn
                .jobs()
                .iter()
                .filter(|e| e.assigned_machine.as_deref() == Some(uid.as_str()))
                .map(|e| e.held_resources())
                .sum();
            let mut resources = WorkMachineResources::new(total);
            if !resources.allocate(held, false) {
                return Err(StateError::Resource(format!(
                    "machine {uid} reports {total} but jobs on it hold {held}"
                )));
            }
            let mut machine = match txn.machine(&uid) {
                Some(existing) => existing.clone(),
                None => WorkMachine::new(uid.clone(), resources),
            };
            machine.state = WorkMachineState::Online;
            machine.resources = Some(resources);
            if connection.is_some() {
                machine.connection = connection;
            }
            txn.put_machine(machine);
            Ok(())
        })?;
        info!(machine = %uid, %total, "work machine registered");
        Ok(uid)
    }

    /// Take a machine out of placement.
    ///
    /// Without `force` the machine is `RETIRED` and its jobs keep running; it
    /// goes `OFFLINE` by itself once drained. With `force` it goes `OFFLINE`
    /// at once.
    pub fn unregister_work_machine(&self, uid: &str, force: bool) -> StateResult<WorkMachineState> {
        let state = if force {
            WorkMachineState::Offline
        } else {
            WorkMachineState::Retired
        };
        self.set_machine_state(uid, state)
    }

    /// Set a machine's state; returns the state it ended up in.
    ///
    /// Going `OFFLINE` releases cancelled entries that can no longer be
    /// delivered. Running and paused jobs on it are requeued by the next
    /// scheduling round.
    pub fn set_machine_state(
        &self,
        uid: &str,
        state: WorkMachineState,
    ) -> StateResult<WorkMachineState> {
        let final_state = self.atomic_update(|txn| {
            let mut machine = txn
                .machine(uid)
                .cloned()
                .ok_or_else(|| StateError::NotFound(format!("work machine {uid}")))?;
            if machine.state == state {
                return Ok(state);
            }
            machine.state = state;
            txn.put_machine(machine);
            if state == WorkMachineState::Offline {
                let stranded: Vec<JobUid> = txn
                    .jobs()
                    .iter()
                    .filter(|e| {
                        e.status() == JobStatus::Cancelled
                            && e.assigned_machine.as_deref() == Some(uid)
                    })
                    .map(|e| e.job.uid.clone())
                    .collect();
                for job in stranded {
                    clear_machine(txn, &job)?;
                }
            }
            txn.retire_if_idle(uid);
            Ok(txn.machine(uid).map(|m| m.state).unwrap_or(state))
        })?;
        info!(machine = %uid, state = %final_state, "work machine state changed");
        Ok(final_state)
    }
}

fn clear_machine(txn: &mut Transaction<'_>, uid: &str) -> StateResult<()> {
    let mut entry = txn
        .job(uid)
        .cloned()
        .ok_or_else(|| StateError::NotFound(format!("job {uid}")))?;
    entry.assigned_machine = None;
    txn.put_job(entry)
}
