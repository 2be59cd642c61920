//! Job model: constraints, lifecycle status, runtime statistics and the
//! database entry the scheduler operates on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::resources::ResourceAllocation;

/// Server-assigned opaque job identifier.
pub type JobUid = String;

/// Scheduling priority. Declared from least to most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => write!(f, "LOW"),
            JobPriority::Medium => write!(f, "MEDIUM"),
            JobPriority::High => write!(f, "HIGH"),
            JobPriority::Urgent => write!(f, "URGENT"),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Queued,
    Running,
    Paused,
    Done,
    Cancelled,
    Crashed,
}

impl JobStatus {
    /// True for `DONE`, `CANCELLED` and `CRASHED`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled | JobStatus::Crashed)
    }

    /// True for statuses that take part in scheduling.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running | JobStatus::Paused)
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// `RUNNING -> QUEUED` and `PAUSED -> QUEUED` only occur when the job's
    /// work machine is lost and the job is requeued.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (New, Queued)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Done)
                | (Running, Cancelled)
                | (Running, Crashed)
                | (Running, Queued)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::New => "NEW",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Done => "DONE",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

/// Priority, preemptibility and special-resource demand of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConstraints {
    pub priority: JobPriority,
    #[serde(default = "default_true")]
    pub is_preemptible: bool,
    /// Multiset of special-resource tags; a tag listed twice demands two units.
    #[serde(default)]
    pub special_resources: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Container limits requested by the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConstraints {
    pub cpu_threads: i64,
    pub memory_mb: i64,
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// How to build and run the job's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerContext {
    /// Dockerfile contents used to build the job image.
    pub dockerfile_source: String,
    #[serde(default)]
    pub mounts: Vec<DockerMount>,
}

/// A self-contained container workload submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Empty until the server assigns one.
    #[serde(default)]
    pub uid: JobUid,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub scheduling_constraints: SchedulingConstraints,
    pub docker_constraints: DockerConstraints,
    pub docker_context: DockerContext,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_status() -> JobStatus {
    JobStatus::New
}

impl Job {
    pub fn priority(&self) -> JobPriority {
        self.scheduling_constraints.priority
    }

    pub fn is_preemptible(&self) -> bool {
        self.scheduling_constraints.is_preemptible
    }

    /// Resources reserved on a machine while the job runs.
    ///
    /// Non-URGENT jobs reserve swap equal to their memory so they can be
    /// paused later; URGENT jobs skip that headroom.
    pub fn required_resources(&self) -> ResourceAllocation {
        let c = &self.docker_constraints;
        let swap = if self.priority() == JobPriority::Urgent {
            0
        } else {
            c.memory_mb
        };
        ResourceAllocation::new(c.cpu_threads, c.memory_mb, swap)
    }

    /// Special-resource demand as `tag -> quantity`.
    pub fn special_resource_demand(&self) -> BTreeMap<String, i64> {
        let mut demand = BTreeMap::new();
        for tag in &self.scheduling_constraints.special_resources {
            *demand.entry(tag.clone()).or_insert(0) += 1;
        }
        demand
    }

    /// Reject jobs that can never be scheduled or run.
    pub fn validate(&self) -> CoreResult<()> {
        let c = &self.docker_constraints;
        if c.cpu_threads <= 0 {
            return Err(CoreError::Validation(
                "cpu_threads must be positive".to_string(),
            ));
        }
        if c.memory_mb <= 0 {
            return Err(CoreError::Validation("memory_mb must be positive".to_string()));
        }
        if self.docker_context.dockerfile_source.trim().is_empty() {
            return Err(CoreError::Validation(
                "dockerfile_source must not be empty".to_string(),
            ));
        }
        if self
            .scheduling_constraints
            .special_resources
            .iter()
            .any(|t| t.trim().is_empty())
        {
            return Err(CoreError::Validation(
                "special resource tags must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timestamps (epoch seconds) and accumulated run/pause durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRuntimeStatistics {
    pub time_added: u64,
    #[serde(default)]
    pub time_started: Option<u64>,
    #[serde(default)]
    pub time_finished: Option<u64>,
    #[serde(default)]
    pub running_time_s: u64,
    #[serde(default)]
    pub paused_time_s: u64,
    /// When the job last changed status.
    #[serde(default)]
    pub last_transition: u64,
}

impl JobRuntimeStatistics {
    pub fn new(now: u64) -> Self {
        Self {
            time_added: now,
            last_transition: now,
            ..Self::default()
        }
    }

    /// Accumulate the interval spent in `from` and stamp the transition.
    pub fn record_transition(&mut self, from: JobStatus, to: JobStatus, now: u64) {
        let elapsed = now.saturating_sub(self.last_transition);
        match from {
            JobStatus::Running => self.running_time_s += elapsed,
            JobStatus::Paused => self.paused_time_s += elapsed,
            _ => {}
        }
        if to == JobStatus::Running && self.time_started.is_none() {
            self.time_started = Some(now);
        }
        if to.is_terminal() {
            self.time_finished = Some(now);
        }
        self.last_transition = now;
    }

    /// Whether the job existed and was unfinished at some point in `[since, now]`.
    pub fn active_since(&self, since: u64) -> bool {
        self.time_finished.is_none_or(|t| t >= since)
    }
}

/// A job as stored by the database: the job, where it runs, and statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseJobEntry {
    pub job: Job,
    #[serde(default)]
    pub assigned_machine: Option<String>,
    pub statistics: JobRuntimeStatistics,
}

impl DatabaseJobEntry {
    pub fn new(job: Job, now: u64) -> Self {
        Self {
            job,
            assigned_machine: None,
            statistics: JobRuntimeStatistics::new(now),
        }
    }

    pub fn uid(&self) -> &str {
        &self.job.uid
    }

    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    /// What this entry currently holds on its machine.
    ///
    /// A running job holds its full requirement, a paused job only its swap.
    pub fn held_resources(&self) -> ResourceAllocation {
        resources_held_in(self.job.status, &self.job)
    }
}

/// Resources a job in `status` holds on its machine.
pub fn resources_held_in(status: JobStatus, job: &Job) -> ResourceAllocation {
    match status {
        JobStatus::Running => job.required_resources(),
        JobStatus::Paused => job.required_resources().swap_part(),
        _ => ResourceAllocation::zero(),
    }
}
