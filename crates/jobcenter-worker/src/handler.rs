//! Worker-side command handlers.
//!
//! Keeps the jobs this worker currently hosts, keyed by uid, and translates
//! each command into container runtime calls. A `StartJobCommand` is
//! acknowledged once the job is reserved; the image build and container
//! start run in the background and a failure is reported like an exit.
//! Containers stopped by a cancel are remembered so their exit is not
//! reported back as a crash.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use jobcenter_control::{Caller, CommandHandler, Response, WorkerCommand};
use jobcenter_core::{Job, JobUid};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::lifecycle::LifecycleEvent;
use crate::runtime::{ContainerExit, ContainerId, ContainerRuntime};

#[derive(Debug, Clone)]
struct HostedJob {
    container: ContainerId,
    paused: bool,
}

#[derive(Default)]
struct Hosted {
    jobs: HashMap<JobUid, HostedJob>,
    /// Jobs being built or started; they count as present.
    starting: HashSet<JobUid>,
    /// Starting jobs cancelled before their container existed.
    abandoned: HashSet<JobUid>,
    cancelled: HashSet<ContainerId>,
    /// Exits seen while some job was still starting, keyed by container.
    early_exits: HashMap<ContainerId, i64>,
}

impl Hosted {
    fn get(&self, uid: &str) -> WorkerResult<&HostedJob> {
        if self.starting.contains(uid) {
            return Err(WorkerError::Starting(uid.to_string()));
        }
        self.jobs
            .get(uid)
            .ok_or_else(|| WorkerError::UnknownJob(uid.to_string()))
    }

    fn active(&self) -> usize {
        self.jobs.len() + self.starting.len()
    }

    fn settle(&mut self, uid: &str) -> bool {
        self.starting.remove(uid);
        if self.starting.is_empty() {
            self.early_exits.clear();
        }
        self.abandoned.remove(uid)
    }
}

fn exit_event(uid: JobUid, exit_code: i64) -> LifecycleEvent {
    if exit_code == 0 {
        LifecycleEvent::Finished(uid)
    } else {
        LifecycleEvent::Crashed { uid, exit_code }
    }
}

/// What a container exit means to this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    /// One of our jobs ended.
    Report(LifecycleEvent),
    /// A container we killed for a cancel.
    Cancelled,
    /// A container this worker never started.
    Foreign,
}

impl ExitDisposition {
    /// Whether the container was started by this worker.
    pub fn is_ours(&self) -> bool {
        !matches!(self, ExitDisposition::Foreign)
    }
}

pub struct WorkerHandler {
    me: Weak<WorkerHandler>,
    runtime: Arc<dyn ContainerRuntime>,
    events: mpsc::Sender<LifecycleEvent>,
    hosted: Mutex<Hosted>,
    running: AtomicBool,
    active_tx: watch::Sender<usize>,
}

impl WorkerHandler {
    /// Start failures of background starts are posted on `events`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Arc<Self> {
        let (active_tx, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            events,
            hosted: Mutex::new(Hosted::default()),
            running: AtomicBool::new(true),
            active_tx,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Jobs present on this worker, including those still starting.
    pub fn active_jobs(&self) -> usize {
        self.hosted.lock().active()
    }

    pub fn hosts(&self, uid: &str) -> bool {
        let hosted = self.hosted.lock();
        hosted.jobs.contains_key(uid) || hosted.starting.contains(uid)
    }

    /// Resolve once no job is left on this worker.
    pub async fn wait_drained(&self) {
        let mut rx = self.active_tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn publish(&self, hosted: &Hosted) {
        self.active_tx.send_replace(hosted.active());
    }

    // ── Commands ───────────────────────────────────────────────────

    fn reserve(&self, uid: &str) -> WorkerResult<()> {
        let mut hosted = self.hosted.lock();
        if hosted.jobs.contains_key(uid) || !hosted.starting.insert(uid.to_string()) {
            return Err(WorkerError::Duplicate(uid.to_string()));
        }
        self.publish(&hosted);
        Ok(())
    }

    /// Build and start a job, waiting for its container.
    pub async fn start_job(&self, job: Job) -> WorkerResult<ContainerId> {
        self.reserve(&job.uid)?;
        self.launch(&job, false).await
    }

    /// Reserve a job and start it in the background. A build or start
    /// failure is posted as [`LifecycleEvent::Failed`].
    pub fn accept_job(&self, job: Job) -> WorkerResult<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| WorkerError::runtime("start", "worker is shutting down"))?;
        self.reserve(&job.uid)?;
        info!(job = %job.uid, "job accepted");
        tokio::spawn(async move {
            let _ = me.launch(&job, true).await;
        });
        Ok(())
    }

    async fn build_and_run(&self, job: &Job) -> WorkerResult<ContainerId> {
        let image = self.runtime.build_image(job).await?;
        self.runtime.run(job, &image).await
    }

    async fn post(&self, event: LifecycleEvent) {
        let uid = event.uid().to_string();
        if self.events.send(event).await.is_err() {
            warn!(job = %uid, "lifecycle channel closed; event not reported");
        }
    }

    /// The job stays in `starting` until its outcome is posted, so a drain
    /// never completes ahead of the report.
    async fn launch(&self, job: &Job, report: bool) -> WorkerResult<ContainerId> {
        let uid = &job.uid;
        let container = match self.build_and_run(job).await {
            Ok(container) => container,
            Err(e) => {
                warn!(job = %uid, error = %e, "job failed to start");
                let abandoned = self.hosted.lock().abandoned.contains(uid);
                if report && !abandoned {
                    self.post(LifecycleEvent::Failed {
                        uid: uid.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                }
                let mut hosted = self.hosted.lock();
                hosted.settle(uid);
                self.publish(&hosted);
                return Err(e);
            }
        };

        let (abandoned, early_exit) = {
            let mut hosted = self.hosted.lock();
            match hosted.early_exits.remove(&container) {
                Some(code) => (hosted.abandoned.contains(uid), Some(code)),
                None => {
                    let abandoned = hosted.settle(uid);
                    if abandoned {
                        hosted.cancelled.insert(container.clone());
                    } else {
                        hosted.jobs.insert(
                            uid.clone(),
                            HostedJob {
                                container: container.clone(),
                                paused: false,
                            },
                        );
                        info!(job = %uid, %container, "job started");
                    }
                    self.publish(&hosted);
                    (abandoned, None)
                }
            }
        };

        if let Some(exit_code) = early_exit {
            info!(job = %uid, %container, exit_code, "job exited while starting");
            if !abandoned {
                self.post(exit_event(uid.clone(), exit_code)).await;
            }
            if let Err(e) = self.runtime.remove(&container).await {
                debug!(%container, error = %e, "container removal failed");
            }
            let mut hosted = self.hosted.lock();
            hosted.settle(uid);
            self.publish(&hosted);
        } else if abandoned {
            info!(job = %uid, %container, "job cancelled while starting; stopping it");
            if let Err(e) = self.runtime.kill(&container).await {
                self.hosted.lock().cancelled.remove(&container);
                warn!(job = %uid, %container, error = %e, "could not stop cancelled container");
            }
        }
        Ok(container)
    }

    pub async fn pause_job(&self, uid: &str) -> WorkerResult<()> {
        let container = {
            let hosted = self.hosted.lock();
            let job = hosted.get(uid)?;
            if job.paused {
                return Err(WorkerError::NotRunning(uid.to_string()));
            }
            job.container.clone()
        };
        self.runtime.pause(&container).await?;
        self.set_paused(uid, true);
        info!(job = %uid, "job paused");
        Ok(())
    }

    pub async fn resume_job(&self, uid: &str) -> WorkerResult<()> {
        let container = {
            let hosted = self.hosted.lock();
            let job = hosted.get(uid)?;
            if !job.paused {
                return Err(WorkerError::NotPaused(uid.to_string()));
            }
            job.container.clone()
        };
        self.runtime.resume(&container).await?;
        self.set_paused(uid, false);
        info!(job = %uid, "job resumed");
        Ok(())
    }

    pub async fn cancel_job(&self, uid: &str) -> WorkerResult<()> {
        let job = {
            let mut hosted = self.hosted.lock();
            if hosted.starting.contains(uid) {
                hosted.abandoned.insert(uid.to_string());
                info!(job = %uid, "cancel requested while job is starting");
                return Ok(());
            }
            let job = hosted.get(uid)?.clone();
            hosted.cancelled.insert(job.container.clone());
            job
        };
        if let Err(e) = self.runtime.kill(&job.container).await {
            self.hosted.lock().cancelled.remove(&job.container);
            return Err(e);
        }
        let mut hosted = self.hosted.lock();
        hosted.jobs.remove(uid);
        self.publish(&hosted);
        info!(job = %uid, "job cancelled");
        Ok(())
    }

    fn set_paused(&self, uid: &str, paused: bool) {
        if let Some(job) = self.hosted.lock().jobs.get_mut(uid) {
            job.paused = paused;
        }
    }

    // ── Exits ──────────────────────────────────────────────────────

    /// Forget the job whose container exited.
    pub fn on_exit(&self, exit: &ContainerExit) -> ExitDisposition {
        let mut hosted = self.hosted.lock();
        if hosted.cancelled.remove(&exit.container) {
            return ExitDisposition::Cancelled;
        }
        let Some(uid) = hosted
            .jobs
            .iter()
            .find(|(_, job)| job.container == exit.container)
            .map(|(uid, _)| uid.clone())
        else {
            // May belong to a job whose start has not returned yet.
            if !hosted.starting.is_empty() {
                hosted
                    .early_exits
                    .insert(exit.container.clone(), exit.exit_code);
            }
            return ExitDisposition::Foreign;
        };
        hosted.jobs.remove(&uid);
        self.publish(&hosted);
        ExitDisposition::Report(exit_event(uid, exit.exit_code))
    }
}

fn reply(result: WorkerResult<()>, uid: &str, done: &str) -> Response {
    match result {
        Ok(()) => Response::ok_with_uid(format!("job {uid} {done}"), uid),
        Err(e) => {
            warn!(job = %uid, error = %e, "worker command failed");
            Response::error(e.code(), e.to_string())
        }
    }
}

#[async_trait]
impl CommandHandler for WorkerHandler {
    type Command = WorkerCommand;

    async fn handle(&self, _caller: &Caller, command: WorkerCommand) -> Response {
        match command {
            WorkerCommand::StartJob(c) => {
                let uid = c.job.uid.clone();
                reply(self.accept_job(c.job), &uid, "accepted")
            }
            WorkerCommand::PauseJob(c) => reply(self.pause_job(&c.uid).await, &c.uid, "paused"),
            WorkerCommand::ResumeJob(c) => reply(self.resume_job(&c.uid).await, &c.uid, "resumed"),
            WorkerCommand::CancelJob(c) => {
                reply(self.cancel_job(&c.uid).await, &c.uid, "cancelled")
            }
            WorkerCommand::Kill(_) => {
                info!("kill requested; no longer accepting jobs");
                self.stop();
                Response::ok("worker shutting down")
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeRuntime, FakeState};
    use jobcenter_control::{KillCommand, KillJobCommand, PauseJobCommand, StartJobCommand};
    use jobcenter_core::{
        DockerConstraints, DockerContext, ErrorCode, JobPriority, JobStatus,
        SchedulingConstraints,
    };

    fn job(uid: &str) -> Job {
        Job {
            uid: uid.to_string(),
            owner_id: "alice".to_string(),
            email: None,
            scheduling_constraints: SchedulingConstraints {
                priority: JobPriority::Medium,
                is_preemptible: true,
                special_resources: vec![],
            },
            docker_constraints: DockerConstraints {
                cpu_threads: 1,
                memory_mb: 128,
            },
            docker_context: DockerContext {
                dockerfile_source: "FROM alpine".to_string(),
                mounts: vec![],
            },
            status: JobStatus::Running,
            label: None,
        }
    }

    fn handler() -> (
        Arc<FakeRuntime>,
        Arc<WorkerHandler>,
        mpsc::Receiver<LifecycleEvent>,
    ) {
        let runtime = Arc::new(FakeRuntime::new());
        let (tx, rx) = mpsc::channel(8);
        (runtime.clone(), WorkerHandler::new(runtime, tx), rx)
    }

    fn admin() -> Caller {
        Caller {
            username: "root".to_string(),
            is_admin: true,
        }
    }

    /// Let background starts run until `uid` has a container.
    async fn wait_started(h: &WorkerHandler, uid: &str) {
        for _ in 0..1000 {
            if h.hosted.lock().jobs.contains_key(uid) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("job {uid} never started");
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let (_, h, _events) = handler();
        h.start_job(job("a")).await.unwrap();
        let err = h.start_job(job("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Duplicate);
        assert_eq!(h.active_jobs(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_follow_container_state() {
        let (runtime, h, _events) = handler();
        let container = h.start_job(job("a")).await.unwrap();

        assert_eq!(h.resume_job("a").await.unwrap_err().code(), ErrorCode::NotPaused);
        h.pause_job("a").await.unwrap();
        assert_eq!(runtime.state(&container), Some(FakeState::Paused));
        assert_eq!(h.pause_job("a").await.unwrap_err().code(), ErrorCode::NotRunning);
        h.resume_job("a").await.unwrap();
        assert_eq!(runtime.state(&container), Some(FakeState::Running));

        assert_eq!(h.pause_job("zz").await.unwrap_err().code(), ErrorCode::UnknownJob);
    }

    #[tokio::test]
    async fn failed_build_leaves_nothing_behind() {
        let (runtime, h, _events) = handler();
        runtime.fail("build");
        let err = h.start_job(job("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Runtime);
        assert!(!h.hosts("a"));
        assert_eq!(h.active_jobs(), 0);
    }

    #[tokio::test]
    async fn start_is_acknowledged_before_the_build_finishes() {
        let (runtime, h, _events) = handler();
        runtime.hold_builds();

        let reply = h
            .handle(
                &admin(),
                WorkerCommand::StartJob(StartJobCommand { job: job("a") }),
            )
            .await;
        assert!(reply.is_success);
        assert!(h.hosts("a"));
        assert_eq!(h.active_jobs(), 1);
        assert_eq!(h.pause_job("a").await.unwrap_err().code(), ErrorCode::Resource);
        assert_eq!(
            h.accept_job(job("a")).unwrap_err().code(),
            ErrorCode::Duplicate
        );

        runtime.release_builds();
        wait_started(&h, "a").await;
        h.pause_job("a").await.unwrap();
    }

    #[tokio::test]
    async fn background_start_failures_are_reported() {
        let (runtime, h, mut events) = handler();
        runtime.fail("build");
        h.accept_job(job("a")).unwrap();

        match events.recv().await.unwrap() {
            LifecycleEvent::Failed { uid, reason } => {
                assert_eq!(uid, "a");
                assert!(reason.contains("injected failure"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.wait_drained().await;
        assert!(!h.hosts("a"));
    }

    #[tokio::test]
    async fn cancel_while_starting_stops_the_new_container() {
        let (runtime, h, mut events) = handler();
        let mut exits = runtime.events().await.unwrap();
        runtime.hold_builds();
        h.accept_job(job("a")).unwrap();

        h.cancel_job("a").await.unwrap();
        runtime.release_builds();
        h.wait_drained().await;

        let exit = exits.recv().await.unwrap();
        assert_eq!(Some(exit.container.clone()), runtime.container_of("a"));
        assert_eq!(h.on_exit(&exit), ExitDisposition::Cancelled);
        assert!(!h.hosts("a"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn exit_racing_the_start_is_still_reported() {
        let (runtime, h, mut events) = handler();
        runtime.hold_builds();
        h.accept_job(job("a")).unwrap();

        // The first fake container is "c1"; its exit lands before `run` returns.
        let early = ContainerExit {
            container: "c1".to_string(),
            exit_code: 3,
        };
        assert_eq!(h.on_exit(&early), ExitDisposition::Foreign);
        runtime.release_builds();

        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Crashed {
                uid: "a".to_string(),
                exit_code: 3
            }
        );
        h.wait_drained().await;
        assert!(!h.hosts("a"));
        assert!(runtime.calls().contains(&"remove:c1".to_string()));
    }

    #[tokio::test]
    async fn exits_become_lifecycle_events() {
        let (_, h, _events) = handler();
        let ok = h.start_job(job("ok")).await.unwrap();
        let bad = h.start_job(job("bad")).await.unwrap();

        let finished = h.on_exit(&ContainerExit {
            container: ok,
            exit_code: 0,
        });
        assert_eq!(
            finished,
            ExitDisposition::Report(LifecycleEvent::Finished("ok".to_string()))
        );
        let crashed = h.on_exit(&ContainerExit {
            container: bad.clone(),
            exit_code: 2,
        });
        assert_eq!(
            crashed,
            ExitDisposition::Report(LifecycleEvent::Crashed {
                uid: "bad".to_string(),
                exit_code: 2
            })
        );
        // Second report of the same container is not ours any more.
        assert_eq!(
            h.on_exit(&ContainerExit { container: bad, exit_code: 2 }),
            ExitDisposition::Foreign
        );
        let other = h.on_exit(&ContainerExit {
            container: "someone-elses-postgres".to_string(),
            exit_code: 0,
        });
        assert!(!other.is_ours());
        assert_eq!(h.active_jobs(), 0);
    }

    #[tokio::test]
    async fn cancelled_jobs_are_not_reported() {
        let (runtime, h, _events) = handler();
        let mut exits = runtime.events().await.unwrap();
        let container = h.start_job(job("a")).await.unwrap();

        h.cancel_job("a").await.unwrap();
        assert!(!h.hosts("a"));
        let exit = exits.recv().await.unwrap();
        assert_eq!(exit.container, container);
        assert_eq!(h.on_exit(&exit), ExitDisposition::Cancelled);

        assert_eq!(h.cancel_job("a").await.unwrap_err().code(), ErrorCode::UnknownJob);
    }

    #[tokio::test]
    async fn commands_map_to_responses() {
        let (_, h, _events) = handler();
        let reply = h
            .handle(
                &admin(),
                WorkerCommand::StartJob(StartJobCommand { job: job("a") }),
            )
            .await;
        assert!(reply.is_success);
        assert_eq!(reply.uid.as_deref(), Some("a"));
        wait_started(&h, "a").await;

        let reply = h
            .handle(
                &admin(),
                WorkerCommand::PauseJob(PauseJobCommand {
                    uid: "nope".to_string(),
                }),
            )
            .await;
        assert_eq!(reply.error, Some(ErrorCode::UnknownJob));

        let reply = h
            .handle(
                &admin(),
                WorkerCommand::CancelJob(KillJobCommand {
                    uid: "a".to_string(),
                }),
            )
            .await;
        assert!(reply.is_success);

        h.handle(&admin(), WorkerCommand::Kill(KillCommand {})).await;
        assert!(!h.is_running());
    }

    #[tokio::test]
    async fn drain_waits_for_the_last_exit() {
        let (runtime, h, _events) = handler();
        let container = h.start_job(job("a")).await.unwrap();

        let waiter = tokio::spawn({
            let h = h.clone();
            async move { h.wait_drained().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        h.on_exit(&ContainerExit {
            container,
            exit_code: 0,
        });
        waiter.await.unwrap();
        assert!(runtime.calls().iter().any(|c| c.starts_with("run:")));
    }
}
