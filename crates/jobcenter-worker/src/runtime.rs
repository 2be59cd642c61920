//! Container runtime seam.
//!
//! The worker only needs a handful of container operations plus a stream of
//! exit notifications. [`DockerCliRuntime`](crate::docker::DockerCliRuntime)
//! drives the real `docker` binary; [`FakeRuntime`] keeps containers in
//! memory and lets tests decide when they exit.

use std::collections::HashMap;

use async_trait::async_trait;
use jobcenter_core::Job;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::error::{WorkerError, WorkerResult};

pub type ContainerId = String;

/// A container stopped, for whatever reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExit {
    pub container: ContainerId,
    pub exit_code: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Build the job's image from its Dockerfile source; returns the image tag.
    async fn build_image(&self, job: &Job) -> WorkerResult<String>;

    /// Start a detached container limited to the job's constraints.
    async fn run(&self, job: &Job, image: &str) -> WorkerResult<ContainerId>;

    async fn pause(&self, container: &str) -> WorkerResult<()>;

    async fn resume(&self, container: &str) -> WorkerResult<()>;

    async fn kill(&self, container: &str) -> WorkerResult<()>;

    async fn remove(&self, container: &str) -> WorkerResult<()>;

    /// Exit notifications for containers started after this call.
    async fn events(&self) -> WorkerResult<mpsc::Receiver<ContainerExit>>;
}

// ── In-memory runtime ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeState {
    Running,
    Paused,
    Exited,
}

#[derive(Default)]
struct FakeInner {
    next_id: u64,
    containers: HashMap<ContainerId, FakeState>,
    by_job: HashMap<String, ContainerId>,
    subscribers: Vec<mpsc::Sender<ContainerExit>>,
    failing: Option<&'static str>,
    holding_builds: bool,
    calls: Vec<String>,
}

/// In-memory runtime for tests.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeInner>,
    builds_released: Notify,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail.
    pub fn fail(&self, op: &'static str) {
        self.inner.lock().failing = Some(op);
    }

    /// Keep image builds in progress until [`FakeRuntime::release_builds`].
    pub fn hold_builds(&self) {
        self.inner.lock().holding_builds = true;
    }

    pub fn release_builds(&self) {
        self.inner.lock().holding_builds = false;
        self.builds_released.notify_waiters();
    }

    pub fn container_of(&self, job: &str) -> Option<ContainerId> {
        self.inner.lock().by_job.get(job).cloned()
    }

    pub fn state(&self, container: &str) -> Option<FakeState> {
        self.inner.lock().containers.get(container).copied()
    }

    /// Operations seen so far, as `op:target`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    /// Let the job's container exit with `exit_code`.
    pub async fn exit(&self, job: &str, exit_code: i64) {
        let Some(container) = self.container_of(job) else {
            return;
        };
        self.stop(&container, exit_code).await;
    }

    async fn stop(&self, container: &str, exit_code: i64) {
        let subscribers = {
            let mut inner = self.inner.lock();
            match inner.containers.get_mut(container) {
                Some(state) if *state != FakeState::Exited => *state = FakeState::Exited,
                _ => return,
            }
            inner.subscribers.clone()
        };
        let exit = ContainerExit {
            container: container.to_string(),
            exit_code,
        };
        for tx in subscribers {
            let _ = tx.send(exit.clone()).await;
        }
    }

    fn call(&self, op: &'static str, target: &str) -> WorkerResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("{op}:{target}"));
        if inner.failing == Some(op) {
            return Err(WorkerError::runtime(op, "injected failure"));
        }
        Ok(())
    }

    fn transition(&self, op: &'static str, container: &str, from: FakeState, to: FakeState) -> WorkerResult<()> {
        self.call(op, container)?;
        let mut inner = self.inner.lock();
        match inner.containers.get_mut(container) {
            Some(state) if *state == from => {
                *state = to;
                Ok(())
            }
            Some(state) => Err(WorkerError::runtime(
                op,
                format!("container {container} is {state:?}"),
            )),
            None => Err(WorkerError::runtime(op, format!("no container {container}"))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, job: &Job) -> WorkerResult<String> {
        loop {
            let released = self.builds_released.notified();
            if !self.inner.lock().holding_builds {
                break;
            }
            released.await;
        }
        self.call("build", &job.uid)?;
        Ok(format!("jobcenter/{}", job.uid))
    }

    async fn run(&self, job: &Job, image: &str) -> WorkerResult<ContainerId> {
        self.call("run", image)?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("c{}", inner.next_id);
        inner.containers.insert(id.clone(), FakeState::Running);
        inner.by_job.insert(job.uid.clone(), id.clone());
        Ok(id)
    }

    async fn pause(&self, container: &str) -> WorkerResult<()> {
        self.transition("pause", container, FakeState::Running, FakeState::Paused)
    }

    async fn resume(&self, container: &str) -> WorkerResult<()> {
        self.transition("resume", container, FakeState::Paused, FakeState::Running)
    }

    async fn kill(&self, container: &str) -> WorkerResult<()> {
        self.call("kill", container)?;
        self.stop(container, 137).await;
        Ok(())
    }

    async fn remove(&self, container: &str) -> WorkerResult<()> {
        self.call("remove", container)?;
        self.inner.lock().containers.remove(container);
        Ok(())
    }

    async fn events(&self) -> WorkerResult<mpsc::Receiver<ContainerExit>> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().subscribers.push(tx);
        Ok(rx)
    }
}
