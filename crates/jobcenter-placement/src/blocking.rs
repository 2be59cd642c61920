//! Reserve a machine for a job that will fit once enough running jobs end.

use jobcenter_core::{JobUid, ResourceAllocation};

use crate::policy::{Candidate, MachineSlot, PlacementPolicy};
use crate::subset::best_subset;

/// Feasible iff some subset of the machine's running jobs, once finished,
/// frees enough for the candidate.
///
/// Cost is the number of jobs that must finish, plus `paused_penalty` when
/// the machine holds paused jobs. No job is touched; the caller reserves
/// the winning machine for the rest of the round.
#[derive(Debug, Clone, Copy)]
pub struct BlockingReservation {
    pub paused_penalty: f64,
}

impl Default for BlockingReservation {
    fn default() -> Self {
        Self {
            paused_penalty: 100.0,
        }
    }
}

impl BlockingReservation {
    /// Running jobs on `machine` that must finish before `candidate` fits.
    pub fn jobs_to_wait_for(&self, candidate: &Candidate, machine: &MachineSlot) -> Option<Vec<JobUid>> {
        let running = &machine.running;
        let frees = |subset: &[usize]| -> ResourceAllocation {
            subset.iter().map(|&i| running[i].resources).sum()
        };

        let mut order: Vec<usize> = (0..running.len()).collect();
        order.sort_by(|&a, &b| {
            let size = |i: usize| running[i].resources.cpu_threads + running[i].resources.memory_mb;
            size(b).cmp(&size(a))
        });

        let subset = best_subset(
            running.len(),
            &order,
            |s| !(machine.free() + frees(s) - candidate.required).is_negative(),
            |s| s.len(),
        )?;
        Some(subset.into_iter().map(|i| running[i].uid.clone()).collect())
    }
}

impl PlacementPolicy for BlockingReservation {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn machine_cost(&self, candidate: &Candidate, machine: &MachineSlot) -> Option<(f64, Vec<JobUid>)> {
        let waiting_on = self.jobs_to_wait_for(candidate, machine)?;
        let penalty = if machine.paused.is_empty() {
            0.0
        } else {
            self.paused_penalty
        };
        Some((waiting_on.len() as f64 + penalty, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::{candidate, occupy, slot};

    #[test]
    fn counts_jobs_that_must_finish() {
        let mut m = slot("wm-1", (4, 16, 16));
        occupy(&mut m, "half", 48.0, (2, 8, 8));

        let c = candidate(24.0, (4, 16, 16));
        let waiting = BlockingReservation::default().jobs_to_wait_for(&c, &m).unwrap();
        assert_eq!(waiting, vec!["half".to_string()]);

        let (cost, victims) = BlockingReservation::default().machine_cost(&c, &m).unwrap();
        assert_eq!(cost, 1.0);
        assert!(victims.is_empty());
    }

    #[test]
    fn picks_the_fewest_jobs() {
        let mut m = slot("wm-1", (8, 80, 80));
        occupy(&mut m, "small-1", 48.0, (1, 10, 10));
        occupy(&mut m, "small-2", 48.0, (1, 10, 10));
        occupy(&mut m, "big", 48.0, (6, 60, 60));

        let c = candidate(24.0, (6, 60, 60));
        let waiting = BlockingReservation::default().jobs_to_wait_for(&c, &m).unwrap();
        assert_eq!(waiting, vec!["big".to_string()]);
    }

    #[test]
    fn too_big_for_the_machine_is_infeasible() {
        let m = slot("wm-1", (4, 16, 16));
        let c = candidate(24.0, (8, 16, 16));
        assert!(BlockingReservation::default().machine_cost(&c, &m).is_none());
    }

    #[test]
    fn paused_jobs_make_a_machine_less_attractive() {
        let mut clean = slot("wm-b", (4, 16, 16));
        occupy(&mut clean, "x", 48.0, (2, 8, 8));
        occupy(&mut clean, "y", 48.0, (2, 8, 8));

        let mut paused = slot("wm-a", (4, 16, 32));
        occupy(&mut paused, "z", 48.0, (4, 16, 16));
        assert!(paused.resources.allocate(ResourceAllocation::new(0, 0, 8), false));
        paused.paused.push("p".to_string());

        let c = candidate(24.0, (4, 16, 16));
        let chosen = BlockingReservation::default()
            .assign_machine(&c, &[&paused, &clean])
            .unwrap();
        assert_eq!(chosen.machine, "wm-b");
        assert_eq!(chosen.cost, 2.0);
    }
}
