//! The shared placement skeleton and the machine view policies work on.

use jobcenter_core::{JobUid, MachineUid, ResourceAllocation, WorkMachineResources};
use serde::Serialize;

/// A job on a machine as seen by the placement policies.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedJob {
    pub uid: JobUid,
    pub cost: f64,
    pub preemptible: bool,
    /// Full requirement, swap headroom included.
    pub resources: ResourceAllocation,
}

/// Working copy of one candidate machine for a scheduling round.
#[derive(Debug, Clone)]
pub struct MachineSlot {
    pub uid: MachineUid,
    pub resources: WorkMachineResources,
    pub running: Vec<PlacedJob>,
    /// Jobs paused on the machine; they still hold swap.
    pub paused: Vec<JobUid>,
}

impl MachineSlot {
    pub fn new(uid: impl Into<MachineUid>, resources: WorkMachineResources) -> Self {
        Self {
            uid: uid.into(),
            resources,
            running: Vec::new(),
            paused: Vec::new(),
        }
    }

    pub fn free(&self) -> ResourceAllocation {
        self.resources.free
    }

    pub fn total(&self) -> ResourceAllocation {
        self.resources.total
    }
}

/// The job looking for a machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub uid: JobUid,
    pub cost: f64,
    /// What the job still needs on the machine.
    pub required: ResourceAllocation,
}

/// Outcome of a successful policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub machine: MachineUid,
    pub cost: f64,
    /// Jobs to pause first; empty except for preemption.
    pub victims: Vec<JobUid>,
}

/// Leftover capacity normalised by machine size, summed over components.
///
/// Smaller means a tighter fit.
pub fn fit_cost(leftover: ResourceAllocation, total: ResourceAllocation) -> f64 {
    fn ratio(part: i64, whole: i64) -> f64 {
        if whole <= 0 {
            0.0
        } else {
            part as f64 / whole as f64
        }
    }
    ratio(leftover.cpu_threads, total.cpu_threads)
        + ratio(leftover.memory_mb, total.memory_mb)
        + ratio(leftover.swap_mb, total.swap_mb)
}

/// A way of placing one candidate on one machine.
pub trait PlacementPolicy {
    fn name(&self) -> &'static str;

    /// Cost of placing `candidate` on `machine` and the jobs that must be
    /// paused for it, or `None` when infeasible.
    fn machine_cost(&self, candidate: &Candidate, machine: &MachineSlot) -> Option<(f64, Vec<JobUid>)>;

    /// Try every machine and keep the cheapest feasible one.
    ///
    /// Equal costs go to the machine with the lower uid.
    fn assign_machine(&self, candidate: &Candidate, machines: &[&MachineSlot]) -> Option<Assignment> {
        let mut best: Option<Assignment> = None;
        for machine in machines {
            let Some((cost, victims)) = self.machine_cost(candidate, machine) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => cost < b.cost || (cost == b.cost && machine.uid < b.machine),
            };
            if better {
                best = Some(Assignment {
                    machine: machine.uid.clone(),
                    cost,
                    victims,
                });
            }
        }
        best
    }
}
