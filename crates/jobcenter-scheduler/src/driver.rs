//! Scheduler driver: the loop that turns database changes into rounds.
//!
//! Every database write fires [`RescheduleTrigger::on_update`], which
//! stores a single `Notify` permit. The driver loop wakes on that permit,
//! runs one round inside an atomic update, then hands the committed
//! distribution to the [`Dispatcher`]. Triggers arriving mid-round collapse
//! into one follow-up round.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jobcenter_core::{DatabaseJobEntry, JobStatus, ServerConfig, WorkMachine, WorkMachineState};
use jobcenter_state::{Database, StateError, UpdateSink};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::algorithm::{AlgorithmConfig, ScheduleInput, ScheduleOutcome, SchedulingAlgorithm};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{SchedulerError, SchedulerResult};

/// Database sink that wakes the driver.
#[derive(Clone, Default)]
pub struct RescheduleTrigger {
    notify: Arc<Notify>,
}

impl RescheduleTrigger {
    pub fn fire(&self) {
        self.notify.notify_one();
    }
}

impl UpdateSink for RescheduleTrigger {
    fn on_update(&self) {
        self.fire();
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub algorithm: AlgorithmConfig,
    pub special_resources: BTreeMap<String, i64>,
    pub retry_interval: Duration,
    pub database_retry_budget: u32,
}

impl DriverConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            algorithm: AlgorithmConfig {
                blocking_enabled: config.blocking_enabled,
                preemption_enabled: config.preemption_enabled,
            },
            special_resources: config.special_resources.clone(),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            database_retry_budget: config.database_retry_budget,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from_server_config(&ServerConfig::default())
    }
}

/// Result of one [`SchedulerDriver::reschedule_once`].
#[derive(Debug)]
pub struct RoundReport {
    pub outcome: ScheduleOutcome,
    pub dispatch: DispatchReport,
}

pub struct SchedulerDriver {
    db: Database,
    algorithm: SchedulingAlgorithm,
    dispatcher: Dispatcher,
    config: DriverConfig,
    trigger: RescheduleTrigger,
}

impl SchedulerDriver {
    /// Build a driver and subscribe it to `db`.
    pub fn new(
        db: Database,
        algorithm: SchedulingAlgorithm,
        dispatcher: Dispatcher,
        config: DriverConfig,
    ) -> Self {
        let trigger = RescheduleTrigger::default();
        db.subscribe_updates(Arc::new(trigger.clone()));
        Self {
            db,
            algorithm,
            dispatcher,
            config,
            trigger,
        }
    }

    pub fn trigger(&self) -> RescheduleTrigger {
        self.trigger.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run rounds until `shutdown` fires. Only returns an error once the
    /// database retry budget is spent.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        info!(
            retry_interval = ?self.config.retry_interval,
            blocking = self.config.algorithm.blocking_enabled,
            preemption = self.config.algorithm.preemption_enabled,
            "scheduler driver started"
        );
        let notify = self.trigger.notify.clone();
        let mut retry_at = Some(Instant::now());
        let mut storage_failures = 0u32;

        loop {
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = retry => {}
                _ = shutdown.changed() => {
                    info!("scheduler driver shutting down");
                    return Ok(());
                }
            }
            retry_at = None;

            match self.reschedule_once().await {
                Ok(report) => {
                    storage_failures = 0;
                    if report.dispatch.needs_retry() {
                        retry_at = Some(Instant::now() + self.config.retry_interval);
                    }
                }
                Err(SchedulerError::State(e)) if e.is_storage() => {
                    storage_failures += 1;
                    if storage_failures > self.config.database_retry_budget {
                        error!(error = %e, attempts = storage_failures, "database unavailable; giving up");
                        return Err(SchedulerError::DatabaseUnavailable {
                            attempts: storage_failures,
                            source: e,
                        });
                    }
                    warn!(error = %e, attempts = storage_failures, "database write failed; will retry");
                    retry_at = Some(Instant::now() + self.config.retry_interval);
                }
                Err(e) => {
                    error!(error = %e, "reschedule failed");
                    retry_at = Some(Instant::now() + self.config.retry_interval);
                }
            }
        }
    }

    /// One scheduling round: compute and commit the new distribution, then
    /// dispatch it and feed worker outcomes back into the database.
    pub async fn reschedule_once(&mut self) -> SchedulerResult<RoundReport> {
        let outcome = self.commit_round()?;
        if !outcome.is_noop() {
            info!(
                changed = outcome.changed_jobs.len(),
                preempted = outcome.preemptions.len(),
                reserved = outcome.reservations.len(),
                waiting = outcome.left_waiting.len(),
                requeued = outcome.requeued.len(),
                "schedule updated"
            );
        }

        let schedule = self.db.current_schedule();
        let machines = self.db.work_machines();
        let dispatch = self.dispatcher.dispatch(&schedule, &machines).await;
        self.apply(&dispatch)?;
        Ok(RoundReport { outcome, dispatch })
    }

    fn commit_round(&self) -> SchedulerResult<ScheduleOutcome> {
        let algorithm = &self.algorithm;
        let special = &self.config.special_resources;
        let outcome = self.db.atomic_update(|txn| {
            let entries: Vec<DatabaseJobEntry> = txn
                .jobs()
                .into_iter()
                .filter(|e| e.status().is_active())
                .cloned()
                .collect();
            let machines: Vec<WorkMachine> = txn.machines().into_iter().cloned().collect();
            let outcome = algorithm.schedule(ScheduleInput {
                entries: &entries,
                machines: &machines,
                special_resources: special,
                now: txn.now(),
            });
            for entry in &outcome.changed_jobs {
                txn.put_job(entry.clone())?;
            }
            for machine in &outcome.changed_machines {
                txn.put_machine(machine.clone());
            }
            Ok::<_, StateError>(outcome)
        })?;
        Ok(outcome)
    }

    fn apply(&self, report: &DispatchReport) -> SchedulerResult<()> {
        for uid in &report.cancelled {
            if let Err(e) = self.db.release_cancelled(uid) {
                if e.is_storage() {
                    return Err(e.into());
                }
                debug!(job = %uid, error = %e, "cancelled job already released");
            }
        }
        for uid in &report.crashed {
            match self.db.job(uid).map(|e| e.status()) {
                Some(JobStatus::Running) => self.db.finish_job(uid, true)?,
                status => debug!(job = %uid, ?status, "crash report for job no longer running"),
            }
        }
        for uid in &report.lost {
            self.db.requeue_job(uid)?;
        }
        for machine in &report.offline_machines {
            warn!(%machine, "worker unreachable; taking it offline");
            self.db.set_machine_state(machine, WorkMachineState::Offline)?;
            self.dispatcher.factory().invalidate(machine);
        }
        Ok(())
    }
}
