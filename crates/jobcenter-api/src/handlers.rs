//! Statistics handlers.
//!
//! Each handler takes a read-only snapshot from the [`Database`] and renders
//! it as YAML.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use jobcenter_core::{DatabaseJobEntry, ResourceAllocation, WorkMachineState};
use serde::Serialize;

use crate::ApiState;

pub const YAML_CONTENT_TYPE: &str = "application/x-yaml";

/// A YAML response body.
pub struct Yaml<T>(pub T);

impl<T: Serialize> IntoResponse for Yaml<T> {
    fn into_response(self) -> Response {
        match serde_yaml::to_string(&self.0) {
            Ok(body) => ([(CONTENT_TYPE, YAML_CONTENT_TYPE)], body).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MachineWorkload {
    pub uid: String,
    pub state: WorkMachineState,
    pub used: ResourceAllocation,
    pub free: ResourceAllocation,
}

/// Compact view of a job for listings.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub uid: String,
    pub owner_id: String,
    pub label: Option<String>,
    pub status: jobcenter_core::JobStatus,
    pub priority: jobcenter_core::JobPriority,
    pub assigned_machine: Option<String>,
    pub time_added: u64,
    pub time_started: Option<u64>,
    pub time_finished: Option<u64>,
    pub running_time_s: u64,
    pub paused_time_s: u64,
}

impl From<DatabaseJobEntry> for JobSummary {
    fn from(entry: DatabaseJobEntry) -> Self {
        let stats = entry.statistics;
        Self {
            status: entry.status(),
            priority: entry.job.priority(),
            uid: entry.job.uid,
            owner_id: entry.job.owner_id,
            label: entry.job.label,
            assigned_machine: entry.assigned_machine,
            time_added: stats.time_added,
            time_started: stats.time_started,
            time_finished: stats.time_finished,
            running_time_s: stats.running_time_s,
            paused_time_s: stats.paused_time_s,
        }
    }
}

fn summaries(entries: Vec<DatabaseJobEntry>) -> Vec<JobSummary> {
    entries.into_iter().map(JobSummary::from).collect()
}

/// GET /v1/workmachines/workload
pub async fn workload(State(state): State<ApiState>) -> impl IntoResponse {
    let machines: Vec<MachineWorkload> = state
        .db
        .work_machines()
        .into_iter()
        .filter_map(|m| {
            let res = m.resources?;
            Some(MachineWorkload {
                uid: m.uid,
                state: m.state,
                used: res.used(),
                free: res.free,
            })
        })
        .collect();
    Yaml(machines)
}

/// GET /v1/workmachines/{uid}
pub async fn machine_jobs(State(state): State<ApiState>, Path(uid): Path<String>) -> Response {
    if state.db.machine(&uid).is_none() {
        return not_found().await.into_response();
    }
    Yaml(summaries(state.db.jobs_on_machine(&uid))).into_response()
}

/// GET /v1/jobs/{uid}
pub async fn get_job(State(state): State<ApiState>, Path(uid): Path<String>) -> Response {
    match state.db.job(&uid) {
        Some(entry) => Yaml(entry).into_response(),
        None => not_found().await.into_response(),
    }
}

/// GET /v1/jobs/hours/{n}
pub async fn recent_jobs(State(state): State<ApiState>, Path(n): Path<String>) -> Response {
    let Ok(hours) = n.parse::<u64>() else {
        return not_found().await.into_response();
    };
    let since = state.db.now().saturating_sub(hours.saturating_mul(3600));
    Yaml(summaries(state.db.jobs_active_since(since))).into_response()
}

/// GET /v1/user/{name}/jobs
pub async fn user_jobs(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    Yaml(summaries(state.db.jobs(&jobcenter_state::JobFilter::owner(name))))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, [(CONTENT_TYPE, YAML_CONTENT_TYPE)], "error: not found\n")
}
