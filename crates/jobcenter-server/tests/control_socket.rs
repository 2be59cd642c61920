//! The server daemon driven through its control socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_control::{
    AddJobCommand, CancelJobCommand, ControlClient, JobSelector, KillCommand, QueryJobCommand,
    RegisterWorkMachineCommand, Response, ServerCommand,
};
use jobcenter_core::{
    DatabaseJobEntry, DockerConstraints, DockerContext, ErrorCode, Job, JobPriority, JobStatus,
    ResourceAllocation, SchedulingConstraints, ServerConfig, WorkMachine,
};
use jobcenter_scheduler::{ProxyConnector, ProxyReply, SchedulerResult, WorkerProxy};
use jobcenter_server::JobCenter;
use jobcenter_state::{Database, ManualClock};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const ADMIN: &str = "jc-admin";

#[derive(Default)]
struct Worker(Mutex<Vec<(String, String)>>);

struct Proxy(Arc<Worker>);

#[async_trait]
impl WorkerProxy for Proxy {
    async fn dispatch_job(&self, job: &Job) -> SchedulerResult<ProxyReply> {
        self.0.0.lock().push(("start".to_string(), job.uid.clone()));
        Ok(ProxyReply::ok("started"))
    }
    async fn cancel_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.0.0.lock().push(("cancel".to_string(), uid.to_string()));
        Ok(ProxyReply::ok("cancelled"))
    }
    async fn pause_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.0.0.lock().push(("pause".to_string(), uid.to_string()));
        Ok(ProxyReply::ok("paused"))
    }
    async fn resume_job(&self, uid: &str) -> SchedulerResult<ProxyReply> {
        self.0.0.lock().push(("resume".to_string(), uid.to_string()));
        Ok(ProxyReply::ok("resumed"))
    }
}

struct Connector(Arc<Worker>);

impl ProxyConnector for Connector {
    fn connect(&self, _: &WorkMachine) -> SchedulerResult<Arc<dyn WorkerProxy>> {
        Ok(Arc::new(Proxy(self.0.clone())))
    }
}

struct Running {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    db: Database,
    worker: Arc<Worker>,
    _shutdown: watch::Sender<bool>,
    handle: JoinHandle<jobcenter_server::ServerResult<()>>,
}

impl Running {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("server.sock");
        let config = ServerConfig {
            admin_group: ADMIN.to_string(),
            control_socket: socket.clone(),
            ..ServerConfig::default()
        };
        let db = Database::in_memory(Arc::new(ManualClock::new(10_000))).unwrap();
        let worker = Arc::new(Worker::default());
        let server = JobCenter::new(config, db.clone()).trust_claimed_usernames(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connector = Arc::new(Connector(worker.clone()));
        let handle = tokio::spawn(server.run(connector, shutdown_rx));

        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Self {
            _dir: dir,
            socket,
            db,
            worker,
            _shutdown: shutdown_tx,
            handle,
        }
    }

    async fn send(&self, user: &str, command: ServerCommand) -> Response {
        ControlClient::local(&self.socket)
            .with_username(user)
            .send(&command)
            .await
            .unwrap()
    }

    async fn wait_for(&self, uid: &str, status: JobStatus) {
        for _ in 0..200 {
            if self.db.job(uid).is_some_and(|e| e.status() == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {uid} never reached {status}");
    }
}

fn job(label: &str) -> Job {
    Job {
        uid: String::new(),
        owner_id: String::new(),
        email: None,
        scheduling_constraints: SchedulingConstraints {
            priority: JobPriority::Medium,
            is_preemptible: true,
            special_resources: vec![],
        },
        docker_constraints: DockerConstraints {
            cpu_threads: 2,
            memory_mb: 1024,
        },
        docker_context: DockerContext {
            dockerfile_source: "FROM alpine\nCMD [\"true\"]".to_string(),
            mounts: vec![],
        },
        status: JobStatus::New,
        label: Some(label.to_string()),
    }
}

#[tokio::test]
async fn submitted_job_runs_once_a_machine_registers() {
    let server = Running::start().await;

    let reply = server
        .send("alice", ServerCommand::AddJob(AddJobCommand { job: job("etl") }))
        .await;
    assert!(reply.is_success, "{}", reply.result_string);
    let uid = reply.uid.unwrap();
    server.wait_for(&uid, JobStatus::Queued).await;

    let reply = server
        .send(
            ADMIN,
            ServerCommand::RegisterWorkMachine(RegisterWorkMachineCommand {
                uid: Some("wm-1".to_string()),
                resources: ResourceAllocation::new(4, 8192, 4096),
                connection: None,
            }),
        )
        .await;
    assert!(reply.is_success, "{}", reply.result_string);

    server.wait_for(&uid, JobStatus::Running).await;
    assert!(
        server
            .worker
            .0
            .lock()
            .contains(&("start".to_string(), uid.clone()))
    );

    let reply = server
        .send(
            "alice",
            ServerCommand::QueryJob(QueryJobCommand {
                selector: JobSelector::label("etl"),
            }),
        )
        .await;
    assert!(reply.is_success);
    let entry: DatabaseJobEntry = serde_yaml::from_str(&reply.result_string).unwrap();
    assert_eq!(entry.assigned_machine.as_deref(), Some("wm-1"));
    assert_eq!(entry.job.owner_id, "alice");

    let reply = server
        .send(
            "alice",
            ServerCommand::CancelJob(CancelJobCommand {
                selector: JobSelector::uid(uid.clone()),
            }),
        )
        .await;
    assert!(reply.is_success);
    server.wait_for(&uid, JobStatus::Cancelled).await;

    let reply = server.send(ADMIN, ServerCommand::Kill(KillCommand {})).await;
    assert!(reply.is_success);
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn admin_commands_need_the_admin_group() {
    let server = Running::start().await;

    let reply = server
        .send(
            "mallory",
            ServerCommand::RegisterWorkMachine(RegisterWorkMachineCommand {
                uid: None,
                resources: ResourceAllocation::new(1, 1024, 0),
                connection: None,
            }),
        )
        .await;
    assert!(!reply.is_success);
    assert_eq!(reply.error, Some(ErrorCode::Permission));
    assert!(server.db.work_machines().is_empty());

    let reply = server.send("mallory", ServerCommand::Kill(KillCommand {})).await;
    assert_eq!(reply.error, Some(ErrorCode::Permission));

    let reply = server.send(ADMIN, ServerCommand::Kill(KillCommand {})).await;
    assert!(reply.is_success);
    server.handle.await.unwrap().unwrap();
    assert!(!server.socket.exists());
}
