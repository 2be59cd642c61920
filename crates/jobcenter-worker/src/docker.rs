//! [`ContainerRuntime`] backed by the `docker` command line.

use std::process::Stdio;

use async_trait::async_trait;
use jobcenter_core::Job;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::runtime::{ContainerExit, ContainerId, ContainerRuntime};

const IMAGE_PREFIX: &str = "jobcenter";
/// Label put on every container started for a job; value is the job uid.
const JOB_LABEL: &str = "jobcenter.job";

pub struct DockerCliRuntime {
    binary: String,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, op: &'static str, args: &[String]) -> WorkerResult<String> {
        debug!(op, ?args, "docker");
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(WorkerError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::runtime(op, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `docker events` arguments: deaths of containers started for jobs.
pub fn events_args() -> Vec<String> {
    [
        "events",
        "--filter",
        "type=container",
        "--filter",
        "event=die",
        "--filter",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([
        format!("label={JOB_LABEL}"),
        "--format".to_string(),
        "{{json .}}".to_string(),
    ])
    .collect()
}

/// `docker run` arguments for a job, excluding the binary.
pub fn run_args(job: &Job, image: &str) -> Vec<String> {
    let limits = job.required_resources();
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        format!("{IMAGE_PREFIX}-{}", job.uid),
        "--label".to_string(),
        format!("{JOB_LABEL}={}", job.uid),
        format!("--cpus={}", limits.cpu_threads),
        format!("--memory={}m", limits.memory_mb),
        // --memory-swap is memory plus swap
        format!("--memory-swap={}m", limits.memory_mb + limits.swap_mb),
    ];
    for mount in &job.docker_context.mounts {
        let mut volume = format!(
            "{}:{}",
            mount.host_path.display(),
            mount.container_path.display()
        );
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }
    args.push(image.to_string());
    args
}

#[derive(Debug, Deserialize)]
struct DockerEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor")]
    actor: DockerActor,
}

#[derive(Debug, Deserialize)]
struct DockerActor {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: std::collections::HashMap<String, String>,
}

/// Parse one `docker events --format '{{json .}}'` line. Events other than
/// `die` yield `None`.
pub fn parse_event(line: &str) -> WorkerResult<Option<ContainerExit>> {
    let event: DockerEvent = serde_json::from_str(line)?;
    if event.action != "die" {
        return Ok(None);
    }
    let exit_code = event
        .actor
        .attributes
        .get("exitCode")
        .and_then(|c| c.parse().ok())
        .unwrap_or(-1);
    Ok(Some(ContainerExit {
        container: event.actor.id,
        exit_code,
    }))
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn build_image(&self, job: &Job) -> WorkerResult<String> {
        let tag = format!("{IMAGE_PREFIX}/{}", job.uid.to_lowercase());
        let mut child = Command::new(&self.binary)
            .args(["build", "-q", "-t", &tag, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(WorkerError::Spawn)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(job.docker_context.dockerfile_source.as_bytes())
                .await
                .map_err(WorkerError::Spawn)?;
        }
        let output = child.wait_with_output().await.map_err(WorkerError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::runtime("build", stderr.trim()));
        }
        info!(job = %job.uid, image = %tag, "image built");
        Ok(tag)
    }

    async fn run(&self, job: &Job, image: &str) -> WorkerResult<ContainerId> {
        let id = self.docker("run", &run_args(job, image)).await?;
        info!(job = %job.uid, container = %id, "container started");
        Ok(id)
    }

    async fn pause(&self, container: &str) -> WorkerResult<()> {
        self.docker("pause", &["pause".to_string(), container.to_string()])
            .await
            .map(drop)
    }

    async fn resume(&self, container: &str) -> WorkerResult<()> {
        self.docker("unpause", &["unpause".to_string(), container.to_string()])
            .await
            .map(drop)
    }

    async fn kill(&self, container: &str) -> WorkerResult<()> {
        self.docker("kill", &["kill".to_string(), container.to_string()])
            .await
            .map(drop)
    }

    async fn remove(&self, container: &str) -> WorkerResult<()> {
        self.docker("rm", &["rm".to_string(), "-f".to_string(), container.to_string()])
            .await
            .map(drop)
    }

    async fn events(&self) -> WorkerResult<mpsc::Receiver<ContainerExit>> {
        let mut child = Command::new(&self.binary)
            .args(events_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::runtime("events", "no stdout"))?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_event(&line) {
                        Ok(Some(exit)) => {
                            if tx.send(exit).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "skipping container event"),
                    },
                    Ok(None) => {
                        warn!("docker events stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "docker events stream failed");
                        break;
                    }
                }
            }
            let _ = child.kill().await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcenter_core::{
        DockerConstraints, DockerContext, DockerMount, JobPriority, JobStatus,
        SchedulingConstraints,
    };

    fn job(priority: JobPriority) -> Job {
        Job {
            uid: "j1".to_string(),
            owner_id: "alice".to_string(),
            email: None,
            scheduling_constraints: SchedulingConstraints {
                priority,
                is_preemptible: true,
                special_resources: vec![],
            },
            docker_constraints: DockerConstraints {
                cpu_threads: 2,
                memory_mb: 512,
            },
            docker_context: DockerContext {
                dockerfile_source: "FROM alpine".to_string(),
                mounts: vec![DockerMount {
                    host_path: "/data".into(),
                    container_path: "/in".into(),
                    read_only: true,
                }],
            },
            status: JobStatus::Running,
            label: None,
        }
    }

    #[test]
    fn run_args_carry_limits_and_mounts() {
        let args = run_args(&job(JobPriority::Low), "jobcenter/j1");
        assert_eq!(&args[..2], ["run", "-d"]);
        assert!(args.contains(&"--cpus=2".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--memory-swap=1024m".to_string()));
        assert!(args.contains(&"/data:/in:ro".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("jobcenter/j1"));
    }

    #[test]
    fn events_only_follow_job_containers() {
        let args = events_args();
        assert_eq!(args[0], "events");
        assert!(args.windows(2).any(|w| w[0] == "--filter" && w[1] == "label=jobcenter.job"));
        assert!(args.windows(2).any(|w| w[0] == "--filter" && w[1] == "event=die"));
        assert_eq!(args.last().map(String::as_str), Some("{{json .}}"));
    }

    #[test]
    fn urgent_jobs_get_no_swap() {
        let args = run_args(&job(JobPriority::Urgent), "img");
        assert!(args.contains(&"--memory-swap=512m".to_string()));
    }

    #[test]
    fn die_events_are_parsed() {
        let line = r#"{"status":"die","id":"abc","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"exitCode":"3","name":"jobcenter-j1"}},"time":1}"#;
        let exit = parse_event(line).unwrap().unwrap();
        assert_eq!(exit.container, "abc");
        assert_eq!(exit.exit_code, 3);

        let start = r#"{"Action":"start","Actor":{"ID":"abc","Attributes":{}}}"#;
        assert!(parse_event(start).unwrap().is_none());
        assert!(parse_event("not json").is_err());
    }
}
