//! End-to-end scheduling scenarios against an in-memory database and
//! recording worker proxies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_core::{
    DatabaseJobEntry, DockerConstraints, DockerContext, ErrorCode, Job, JobPriority, JobStatus,
    ResourceAllocation, SchedulingConstraints, WorkMachine, WorkMachineState,
};
use jobcenter_placement::{CostFunction, PriorityAgingCost};
use jobcenter_scheduler::{
    AlgorithmConfig, Dispatcher, DriverConfig, ProxyConnector, ProxyFactory, ProxyReply,
    RoundReport, SchedulerDriver, SchedulerError, SchedulerResult, SchedulingAlgorithm,
    WorkerProxy, held_per_machine,
};
use jobcenter_state::{Database, ManualClock, StatusSink};
use parking_lot::Mutex;

const GB: i64 = 1024;
const HOUR: u64 = 3600;

// ── Fakes ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Worker {
    commands: Mutex<Vec<(String, String)>>,
    down: Mutex<bool>,
    /// Jobs whose container went away without the server hearing of it.
    forgotten: Mutex<Vec<String>>,
}

impl Worker {
    fn record(&self, command: &str, uid: &str) -> SchedulerResult<ProxyReply> {
        if *self.down.lock() {
            return Err(SchedulerError::NoConnection("worker down".to_string()));
        }
        self.commands.lock().push((command.to_string(), uid.to_string()));
        let gone = matches!(command, "pause_job" | "resume_job")
            && self.forgotten.lock().iter().any(|f| f == uid);
        if gone {
            return Ok(ProxyReply::failed(ErrorCode::UnknownJob, "no such job"));
        }
        Ok(ProxyReply::ok("ok"))
    }

    fn take(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.commands.lock())
    }
}

struct FakeProxy(Arc<Worker>);

#[async_trait]
impl WorkerProxy for FakeProxy {
    async fn dispatch_job(&self, job: &Job) -> SchedulerResult<ProxyReply> {
        self.0.record("dispatch_job", &job.uid)
    }
    async fn cancel_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.0.record("cancel_job", uid)
    }
    async fn pause_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.0.record("pause_job", uid)
    }
    async fn resume_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.0.record("resume_job", uid)
    }
}

struct FakeConnector(Arc<Worker>);

impl ProxyConnector for FakeConnector {
    fn connect(&self, _: &WorkMachine) -> SchedulerResult<Arc<dyn WorkerProxy>> {
        Ok(Arc::new(FakeProxy(self.0.clone())))
    }
}

#[derive(Default)]
struct Trace(Mutex<Vec<(String, JobStatus, JobStatus)>>);

impl StatusSink for Trace {
    fn on_status_change(&self, entry: &DatabaseJobEntry, from: JobStatus, to: JobStatus) {
        self.0.lock().push((entry.job.uid.clone(), from, to));
    }
}

impl Trace {
    fn of(&self, uid: &str) -> Vec<JobStatus> {
        let events = self.0.lock();
        let mut path: Vec<JobStatus> = Vec::new();
        for (job, from, to) in events.iter().filter(|(job, ..)| job == uid) {
            if path.is_empty() {
                path.push(*from);
            }
            assert_eq!(path.last(), Some(from), "job {job} trace is not contiguous");
            path.push(*to);
        }
        path
    }

    fn assert_sound(&self) {
        for (uid, from, to) in self.0.lock().iter() {
            assert!(from.can_transition_to(*to), "job {uid}: {from} -> {to}");
        }
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    db: Database,
    clock: Arc<ManualClock>,
    driver: SchedulerDriver,
    worker: Arc<Worker>,
    trace: Arc<Trace>,
    bag: BTreeMap<String, i64>,
}

impl Harness {
    fn new(bag: &[(&str, i64)], max_failures: u32) -> Self {
        let clock = Arc::new(ManualClock::new(1_000 * HOUR));
        let db = Database::in_memory(clock.clone()).unwrap();
        let trace = Arc::new(Trace::default());
        db.subscribe_status(trace.clone());

        let worker = Arc::new(Worker::default());
        let factory = ProxyFactory::new(Arc::new(FakeConnector(worker.clone())), max_failures);
        let dispatcher = Dispatcher::new(Arc::new(factory), Duration::from_secs(1));
        let bag: BTreeMap<String, i64> = bag.iter().map(|(t, q)| (t.to_string(), *q)).collect();
        let config = DriverConfig {
            algorithm: AlgorithmConfig::default(),
            special_resources: bag.clone(),
            retry_interval: Duration::from_millis(10),
            database_retry_budget: 3,
        };
        let driver = SchedulerDriver::new(db.clone(), SchedulingAlgorithm::default(), dispatcher, config);
        Self {
            db,
            clock,
            driver,
            worker,
            trace,
            bag,
        }
    }

    fn machine(&self, uid: &str) {
        self.db
            .register_work_machine(
                Some(uid.to_string()),
                ResourceAllocation::new(4, 16 * GB, 16 * GB),
                None,
            )
            .unwrap();
    }

    fn submit(&self, priority: JobPriority, cpu: i64, mem_gb: i64, tags: &[&str]) -> String {
        let job = Job {
            uid: String::new(),
            owner_id: "alice".to_string(),
            email: None,
            scheduling_constraints: SchedulingConstraints {
                priority,
                is_preemptible: true,
                special_resources: tags.iter().map(|t| t.to_string()).collect(),
            },
            docker_constraints: DockerConstraints {
                cpu_threads: cpu,
                memory_mb: mem_gb * GB,
            },
            docker_context: DockerContext {
                dockerfile_source: "FROM alpine\nCMD [\"sleep\", \"600\"]\n".to_string(),
                mounts: vec![],
            },
            status: JobStatus::New,
            label: None,
        };
        let uid = self.db.add_job(job).unwrap();
        self.clock.advance(1);
        uid
    }

    /// Run rounds until nothing changes; returns every round's report.
    async fn settle(&mut self) -> Vec<RoundReport> {
        let mut reports = Vec::new();
        for _ in 0..10 {
            let report = self.driver.reschedule_once().await.unwrap();
            self.check_invariants();
            let quiet = report.outcome.is_noop() && report.dispatch.is_empty();
            reports.push(report);
            if quiet {
                return reports;
            }
        }
        panic!("schedule did not settle");
    }

    fn status(&self, uid: &str) -> JobStatus {
        self.db.job(uid).unwrap().status()
    }

    fn finish(&self, uid: &str) {
        self.clock.advance(HOUR);
        self.db.finish_job(uid, false).unwrap();
    }

    fn check_invariants(&self) {
        let entries = self.db.current_schedule();
        let held = held_per_machine(&entries);
        for machine in self.db.work_machines() {
            if !machine.state.is_reachable() {
                continue;
            }
            let res = machine.resources.unwrap();
            let used = held.get(&machine.uid).copied().unwrap_or_default();
            assert_eq!(res.free + used, res.total, "conservation on {}", machine.uid);
            assert!(!res.free.is_negative());
        }

        let mut in_use: BTreeMap<String, i64> = BTreeMap::new();
        for entry in &entries {
            if matches!(entry.status(), JobStatus::Running | JobStatus::Paused) {
                for (tag, qty) in entry.job.special_resource_demand() {
                    *in_use.entry(tag).or_default() += qty;
                }
            }
        }
        for (tag, qty) in in_use {
            assert!(qty <= self.bag.get(&tag).copied().unwrap_or(0), "special resource {tag} oversubscribed");
        }
        self.trace.assert_sound();
    }
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn s1_single_job_completes() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let job = h.submit(JobPriority::Low, 4, 16, &[]);

    h.settle().await;
    assert_eq!(h.status(&job), JobStatus::Running);
    assert_eq!(h.worker.take(), vec![("dispatch_job".to_string(), job.clone())]);

    h.finish(&job);
    h.settle().await;
    assert_eq!(h.status(&job), JobStatus::Done);
    assert_eq!(
        h.trace.of(&job),
        vec![JobStatus::New, JobStatus::Queued, JobStatus::Running, JobStatus::Done]
    );
    let res = h.db.machine("wm-1").unwrap().resources.unwrap();
    assert_eq!(res.free, res.total);
    assert!(h.worker.take().is_empty());
}

#[tokio::test]
async fn s2_cancel_queued_job() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let running = h.submit(JobPriority::Low, 4, 16, &[]);
    let queued = h.submit(JobPriority::Low, 4, 16, &[]);
    h.settle().await;
    assert_eq!(h.status(&running), JobStatus::Running);
    assert_eq!(h.status(&queued), JobStatus::Queued);
    let before = h.db.machine("wm-1").unwrap().resources;
    h.worker.take();

    let cancelled = h.db.cancel_job(&queued).unwrap();
    assert_eq!(cancelled.status(), JobStatus::Cancelled);
    assert!(cancelled.assigned_machine.is_none());
    h.settle().await;

    assert_eq!(h.status(&running), JobStatus::Running);
    assert_eq!(h.db.machine("wm-1").unwrap().resources, before);
    assert!(h.worker.take().is_empty());
}

#[tokio::test]
async fn cancel_running_job_is_delivered_then_released() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let job = h.submit(JobPriority::Medium, 2, 8, &[]);
    h.settle().await;
    h.worker.take();

    h.db.cancel_job(&job).unwrap();
    assert_eq!(h.db.job(&job).unwrap().assigned_machine.as_deref(), Some("wm-1"));
    h.settle().await;

    assert_eq!(h.worker.take(), vec![("cancel_job".to_string(), job.clone())]);
    let entry = h.db.job(&job).unwrap();
    assert_eq!(entry.status(), JobStatus::Cancelled);
    assert!(entry.assigned_machine.is_none());
    let res = h.db.machine("wm-1").unwrap().resources.unwrap();
    assert_eq!(res.free, res.total);
}

#[tokio::test]
async fn s3_preemption() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let low = h.submit(JobPriority::Low, 4, 16, &[]);
    h.settle().await;
    h.worker.take();

    let urgent = h.submit(JobPriority::Urgent, 4, 16, &[]);
    let reports = h.settle().await;
    let preemptions: Vec<_> = reports.iter().flat_map(|r| r.outcome.preemptions.clone()).collect();
    assert_eq!(preemptions.len(), 1);
    assert_eq!(preemptions[0].victim, low);
    assert_eq!(preemptions[0].preemptor, urgent);

    let cost = PriorityAgingCost::default();
    let now = h.clock_now();
    let victim_cost = cost.cost(&h.db.job(&low).unwrap(), now);
    let preemptor_cost = cost.cost(&h.db.job(&urgent).unwrap(), now);
    assert!(victim_cost > preemptor_cost);

    assert_eq!(h.status(&low), JobStatus::Paused);
    assert_eq!(h.status(&urgent), JobStatus::Running);
    let mut sent = h.worker.take();
    sent.sort();
    assert_eq!(
        sent,
        vec![
            ("dispatch_job".to_string(), urgent.clone()),
            ("pause_job".to_string(), low.clone()),
        ]
    );

    h.finish(&urgent);
    h.settle().await;
    assert_eq!(h.status(&low), JobStatus::Running);
    assert_eq!(h.worker.take(), vec![("resume_job".to_string(), low.clone())]);

    h.finish(&low);
    h.settle().await;

    use JobStatus::*;
    assert_eq!(h.trace.of(&low), vec![New, Queued, Running, Paused, Running, Done]);
    assert_eq!(h.trace.of(&urgent), vec![New, Queued, Running, Done]);
    let res = h.db.machine("wm-1").unwrap().resources.unwrap();
    assert_eq!(res.free, res.total);
}

#[tokio::test]
async fn s4_blocking_reservation() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let first = h.submit(JobPriority::Medium, 2, 8, &[]);
    h.settle().await;
    h.clock.advance(5 * HOUR);

    let high = h.submit(JobPriority::High, 4, 16, &[]);
    let second = h.submit(JobPriority::Medium, 2, 8, &[]);
    let reports = h.settle().await;
    assert!(reports
        .iter()
        .any(|r| r.outcome.reservations.iter().any(|res| res.job == high && res.machine == "wm-1")));
    assert_eq!(h.status(&high), JobStatus::Queued);
    assert_eq!(h.status(&second), JobStatus::Queued, "reserved machine must not take the second job");

    h.finish(&first);
    h.settle().await;
    assert_eq!(h.status(&high), JobStatus::Running);
    assert_eq!(h.status(&second), JobStatus::Queued);

    h.finish(&high);
    h.settle().await;
    assert_eq!(h.status(&second), JobStatus::Running);
}

#[tokio::test]
async fn s5_urgent_overrides_blocking() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let medium = h.submit(JobPriority::Medium, 2, 8, &[]);
    h.settle().await;

    let high = h.submit(JobPriority::High, 4, 16, &[]);
    h.settle().await;
    assert_eq!(h.status(&high), JobStatus::Queued);
    h.worker.take();

    let urgent = h.submit(JobPriority::Urgent, 2, 8, &[]);
    let reports = h.settle().await;
    assert_eq!(h.status(&urgent), JobStatus::Running);
    assert_eq!(h.status(&medium), JobStatus::Running);
    assert_eq!(h.status(&high), JobStatus::Queued);
    assert!(reports.iter().all(|r| r.outcome.preemptions.is_empty()));
    assert_eq!(h.worker.take(), vec![("dispatch_job".to_string(), urgent.clone())]);

    h.finish(&medium);
    h.settle().await;
    assert_eq!(h.status(&high), JobStatus::Queued);

    h.finish(&urgent);
    h.settle().await;
    assert_eq!(h.status(&high), JobStatus::Running);
}

#[tokio::test]
async fn s6_special_resources() {
    let mut h = Harness::new(&[("A", 1)], 3);
    h.machine("wm-1");
    let first = h.submit(JobPriority::Medium, 1, 1, &["A"]);
    let second = h.submit(JobPriority::Medium, 1, 1, &["A"]);
    h.settle().await;
    assert_eq!(h.status(&first), JobStatus::Running);
    assert_eq!(h.status(&second), JobStatus::Queued);

    h.finish(&first);
    h.settle().await;
    assert_eq!(h.status(&second), JobStatus::Running);
}

// ── Properties ─────────────────────────────────────────────────────

#[tokio::test]
async fn lower_cost_jobs_are_placed_first() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let low = h.submit(JobPriority::Low, 4, 8, &[]);
    let high = h.submit(JobPriority::High, 4, 8, &[]);
    h.settle().await;
    assert_eq!(h.status(&high), JobStatus::Running);
    assert_eq!(h.status(&low), JobStatus::Queued);
}

#[tokio::test]
async fn settled_schedule_sends_no_commands() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    h.machine("wm-2");
    for _ in 0..5 {
        h.submit(JobPriority::Medium, 2, 4, &[]);
    }
    h.settle().await;
    h.worker.take();
    for _ in 0..3 {
        let report = h.driver.reschedule_once().await.unwrap();
        assert!(report.outcome.is_noop());
        assert!(report.dispatch.is_empty());
    }
    assert!(h.worker.take().is_empty());
}

#[tokio::test]
async fn unreachable_worker_goes_offline_and_jobs_requeue() {
    let mut h = Harness::new(&[], 2);
    h.machine("wm-1");
    *h.worker.down.lock() = true;
    let job = h.submit(JobPriority::Low, 1, 1, &[]);

    let first = h.driver.reschedule_once().await.unwrap();
    assert_eq!(first.dispatch.failed, vec![job.clone()]);
    let second = h.driver.reschedule_once().await.unwrap();
    assert_eq!(second.dispatch.offline_machines, vec!["wm-1".to_string()]);
    assert_eq!(h.db.machine("wm-1").unwrap().state, WorkMachineState::Offline);

    h.settle().await;
    let entry = h.db.job(&job).unwrap();
    assert_eq!(entry.status(), JobStatus::Queued);
    assert!(entry.assigned_machine.is_none());

    *h.worker.down.lock() = false;
    h.machine("wm-1");
    h.settle().await;
    assert_eq!(h.status(&job), JobStatus::Running);
}

#[tokio::test]
async fn job_lost_by_its_worker_is_requeued() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let low = h.submit(JobPriority::Low, 4, 16, &[]);
    h.settle().await;
    h.worker.take();
    h.worker.forgotten.lock().push(low.clone());

    let urgent = h.submit(JobPriority::Urgent, 4, 16, &[]);
    let reports = h.settle().await;
    let lost: Vec<_> = reports.iter().flat_map(|r| r.dispatch.lost.clone()).collect();
    assert_eq!(lost, vec![low.clone()]);
    assert!(reports.last().is_some_and(|r| !r.dispatch.needs_retry()));

    let entry = h.db.job(&low).unwrap();
    assert_eq!(entry.status(), JobStatus::Queued);
    assert!(entry.assigned_machine.is_none());
    assert_eq!(h.status(&urgent), JobStatus::Running);

    h.worker.forgotten.lock().clear();
    h.worker.take();
    h.finish(&urgent);
    h.settle().await;
    assert_eq!(h.status(&low), JobStatus::Running);
    assert_eq!(h.worker.take(), vec![("dispatch_job".to_string(), low.clone())]);

    use JobStatus::*;
    assert_eq!(
        h.trace.of(&low),
        vec![New, Queued, Running, Paused, Queued, Running]
    );
}

#[tokio::test]
async fn retired_machine_drains_then_goes_offline() {
    let mut h = Harness::new(&[], 3);
    h.machine("wm-1");
    let job = h.submit(JobPriority::Low, 1, 1, &[]);
    h.settle().await;

    assert_eq!(
        h.db.unregister_work_machine("wm-1", false).unwrap(),
        WorkMachineState::Retired
    );
    let queued = h.submit(JobPriority::Low, 1, 1, &[]);
    h.settle().await;
    assert_eq!(h.status(&job), JobStatus::Running);
    assert_eq!(h.status(&queued), JobStatus::Queued);

    h.finish(&job);
    assert_eq!(h.db.machine("wm-1").unwrap().state, WorkMachineState::Offline);
}

#[tokio::test]
async fn driver_loop_reacts_to_database_writes() {
    let h = Harness::new(&[], 3);
    h.machine("wm-1");
    let (tx, rx) = tokio::sync::watch::channel(false);
    let Harness { db, driver, worker, clock, .. } = h;
    let task = tokio::spawn(driver.run(rx));

    let job = Job {
        uid: "loop-job".to_string(),
        owner_id: "bob".to_string(),
        email: None,
        scheduling_constraints: SchedulingConstraints {
            priority: JobPriority::High,
            is_preemptible: false,
            special_resources: vec![],
        },
        docker_constraints: DockerConstraints {
            cpu_threads: 1,
            memory_mb: GB,
        },
        docker_context: DockerContext {
            dockerfile_source: "FROM alpine".to_string(),
            mounts: vec![],
        },
        status: JobStatus::New,
        label: None,
    };
    db.add_job(job).unwrap();
    clock.advance(1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while worker.commands.lock().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "driver never dispatched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(db.job("loop-job").unwrap().status(), JobStatus::Running);

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

impl Harness {
    fn clock_now(&self) -> u64 {
        self.db.now()
    }
}
