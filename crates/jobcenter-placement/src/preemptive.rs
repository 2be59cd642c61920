//! Pause lower-priority jobs to make room.

use jobcenter_core::{JobUid, ResourceAllocation};

use crate::policy::{Candidate, MachineSlot, PlacedJob, PlacementPolicy, fit_cost};
use crate::subset::best_subset;

/// Feasible iff pausing some set of preemptible running jobs, each costlier
/// than the candidate, frees enough cpu and memory.
///
/// Victims keep their swap. Among feasible sets the one with the lowest
/// total victim cost wins, then the one with fewer victims, then the one
/// displacing less cpu. The machine cost is the fit cost of what remains
/// plus `victim_cost_weight` times the total victim cost.
#[derive(Debug, Clone, Copy)]
pub struct Preemptive {
    pub victim_cost_weight: f64,
}

impl Default for Preemptive {
    fn default() -> Self {
        Self {
            victim_cost_weight: 0.01,
        }
    }
}

impl PlacementPolicy for Preemptive {
    fn name(&self) -> &'static str {
        "preemptive"
    }

    fn machine_cost(&self, candidate: &Candidate, machine: &MachineSlot) -> Option<(f64, Vec<JobUid>)> {
        let eligible: Vec<&PlacedJob> = machine
            .running
            .iter()
            .filter(|j| j.preemptible && j.cost > candidate.cost)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let released = |subset: &[usize]| -> ResourceAllocation {
            subset
                .iter()
                .map(|&i| eligible[i].resources.compute_part())
                .sum()
        };
        let victim_cost = |subset: &[usize]| -> f64 { subset.iter().map(|&i| eligible[i].cost).sum() };

        let mut order: Vec<usize> = (0..eligible.len()).collect();
        order.sort_by(|&a, &b| eligible[a].cost.total_cmp(&eligible[b].cost));

        let subset = best_subset(
            eligible.len(),
            &order,
            |s| !(machine.free() + released(s) - candidate.required).is_negative(),
            |s| (victim_cost(s), s.len(), released(s).cpu_threads),
        )?;
        if subset.is_empty() {
            return None;
        }

        let leftover = machine.free() + released(&subset) - candidate.required;
        let cost = fit_cost(leftover, machine.total()) + self.victim_cost_weight * victim_cost(&subset);
        let victims = subset.into_iter().map(|i| eligible[i].uid.clone()).collect();
        Some((cost, victims))
    }
}
