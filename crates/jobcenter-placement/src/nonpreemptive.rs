//! Place a job into free capacity without disturbing anything.

use jobcenter_core::JobUid;

use crate::policy::{Candidate, MachineSlot, PlacementPolicy, fit_cost};

/// Feasible iff the machine's free resources cover the requirement.
///
/// The requirement of a non-URGENT job includes swap headroom equal to its
/// memory, so a successful placement always leaves room to pause it later.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonPreemptive;

impl PlacementPolicy for NonPreemptive {
    fn name(&self) -> &'static str {
        "non-preemptive"
    }

    fn machine_cost(&self, candidate: &Candidate, machine: &MachineSlot) -> Option<(f64, Vec<JobUid>)> {
        let leftover = machine.free() - candidate.required;
        if leftover.is_negative() {
            return None;
        }
        Some((fit_cost(leftover, machine.total()), Vec::new()))
    }
}
