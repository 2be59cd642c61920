//! Status-change notifier.

use jobcenter_core::{DatabaseJobEntry, JobStatus};
use jobcenter_state::StatusSink;
use tracing::info;

/// Logs every status transition along with the owner's contact address.
/// Delivering mail is left to whatever consumes these log lines.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl StatusSink for LogNotifier {
    fn on_status_change(&self, entry: &DatabaseJobEntry, from: JobStatus, to: JobStatus) {
        info!(
            job = %entry.job.uid,
            owner = %entry.job.owner_id,
            email = entry.job.email.as_deref().unwrap_or("-"),
            label = entry.job.label.as_deref().unwrap_or("-"),
            machine = entry.assigned_machine.as_deref().unwrap_or("-"),
            %from,
            %to,
            "job status changed"
        );
    }
}
