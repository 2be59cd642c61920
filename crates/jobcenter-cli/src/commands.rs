use std::path::Path;

use anyhow::Context;
use clap::Args;
use jobcenter_control::{
    AddJobCommand, CancelJobCommand, JobSelector, QueryJobCommand, Response, ServerCommand,
};
use jobcenter_core::Job;

/// A job addressed by uid or by one of your labels.
#[derive(Debug, Args)]
pub struct Target {
    /// Job uid.
    #[arg(required_unless_present = "label", conflicts_with = "label")]
    pub uid: Option<String>,
    /// Label given at submission.
    #[arg(short, long)]
    pub label: Option<String>,
}

impl From<Target> for JobSelector {
    fn from(target: Target) -> Self {
        JobSelector {
            uid: target.uid,
            label: target.label,
        }
    }
}

pub fn parse_job(yaml: &str) -> anyhow::Result<Job> {
    let job: Job = serde_yaml::from_str(yaml)?;
    job.validate()?;
    Ok(job)
}

pub fn submit(file: &Path) -> anyhow::Result<ServerCommand> {
    let yaml = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let job = parse_job(&yaml).with_context(|| format!("parsing {}", file.display()))?;
    Ok(ServerCommand::AddJob(AddJobCommand { job }))
}

pub fn cancel(target: Target) -> anyhow::Result<ServerCommand> {
    let selector = JobSelector::from(target);
    selector.validate()?;
    Ok(ServerCommand::CancelJob(CancelJobCommand { selector }))
}

pub fn query(target: Target) -> anyhow::Result<ServerCommand> {
    let selector = JobSelector::from(target);
    selector.validate()?;
    Ok(ServerCommand::QueryJob(QueryJobCommand { selector }))
}

pub fn render(response: &Response) -> String {
    let mut out = response.result_string.trim_end().to_string();
    if !response.is_success {
        out = format!("error: {out}");
    }
    out
}
