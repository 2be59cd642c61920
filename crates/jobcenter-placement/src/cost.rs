//! Job cost: lower cost means higher effective priority.

use jobcenter_core::{DatabaseJobEntry, JobPriority};

/// Ranks job entries for a scheduling round.
///
/// Implementations must keep `preempting_threshold() <= blocking_threshold()`.
pub trait CostFunction: Send + Sync {
    fn cost(&self, entry: &DatabaseJobEntry, now: u64) -> f64;

    /// Entries at or below this cost may reserve a machine.
    fn blocking_threshold(&self) -> f64;

    /// Entries at or below this cost may pause other jobs.
    fn preempting_threshold(&self) -> f64;
}

/// Per-priority base cost that decreases as a job waits.
///
/// Units are hours: a job gains `aging_per_hour` per hour since it was
/// added, up to `max_aging`.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityAgingCost {
    pub urgent: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub aging_per_hour: f64,
    pub max_aging: f64,
    pub blocking_threshold: f64,
    pub preempting_threshold: f64,
}

impl Default for PriorityAgingCost {
    fn default() -> Self {
        Self {
            urgent: 0.0,
            high: 24.0,
            medium: 48.0,
            low: 96.0,
            aging_per_hour: 1.0,
            max_aging: 20.0,
            blocking_threshold: 30.0,
            preempting_threshold: 0.0,
        }
    }
}

impl PriorityAgingCost {
    pub fn base(&self, priority: JobPriority) -> f64 {
        match priority {
            JobPriority::Urgent => self.urgent,
            JobPriority::High => self.high,
            JobPriority::Medium => self.medium,
            JobPriority::Low => self.low,
        }
    }
}

impl CostFunction for PriorityAgingCost {
    fn cost(&self, entry: &DatabaseJobEntry, now: u64) -> f64 {
        let waited_hours = now.saturating_sub(entry.statistics.time_added) as f64 / 3600.0;
        let aging = (waited_hours * self.aging_per_hour).min(self.max_aging);
        self.base(entry.job.priority()) - aging
    }

    fn blocking_threshold(&self) -> f64 {
        self.blocking_threshold
    }

    fn preempting_threshold(&self) -> f64 {
        self.preempting_threshold
    }
}
