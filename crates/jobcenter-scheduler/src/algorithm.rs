//! Scheduling algorithm: one round over the whole distribution.
//!
//! Takes a consistent snapshot of job entries and work machines and returns
//! the desired distribution. Pure: it never touches the database or a
//! worker, which makes rounds easy to test and idempotent to re-run.
//!
//! Per round:
//! 1. Build a working copy of every reachable machine and of the global
//!    special-resource bag, minus what running and paused jobs hold.
//! 2. Rank the queued jobs and the paused jobs by cost (ties by age).
//! 3. For each: check special resources, then try non-preemptive placement,
//!    then preemption, then a blocking reservation.
//! 4. Requeue jobs whose machine is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use jobcenter_core::{
    DatabaseJobEntry, JobPriority, JobStatus, JobUid, MachineUid, ResourceAllocation,
    WorkMachine, WorkMachineState,
};
use jobcenter_placement::{
    BlockingReservation, Candidate, CostFunction, MachineSlot, NonPreemptive, PlacedJob,
    PlacementPolicy, Preemptive, PriorityAgingCost,
};
use serde::Serialize;
use tracing::{debug, info};

/// Which of the optional policies are active.
#[derive(Debug, Clone, Copy)]
pub struct AlgorithmConfig {
    pub blocking_enabled: bool,
    pub preemption_enabled: bool,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            blocking_enabled: true,
            preemption_enabled: true,
        }
    }
}

/// Snapshot a round works on.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleInput<'a> {
    pub entries: &'a [DatabaseJobEntry],
    pub machines: &'a [WorkMachine],
    /// Configured global quantity per special-resource tag.
    pub special_resources: &'a BTreeMap<String, i64>,
    pub now: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preemption {
    pub victim: JobUid,
    pub preemptor: JobUid,
    pub machine: MachineUid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reservation {
    pub job: JobUid,
    pub machine: MachineUid,
}

/// Result of a round.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    /// The full new distribution.
    pub entries: Vec<DatabaseJobEntry>,
    /// Every machine, with updated free resources.
    pub machines: Vec<WorkMachine>,
    pub changed_jobs: Vec<DatabaseJobEntry>,
    pub changed_machines: Vec<WorkMachine>,
    pub preemptions: Vec<Preemption>,
    pub reservations: Vec<Reservation>,
    /// Candidates that stayed queued (or paused) this round.
    pub left_waiting: Vec<JobUid>,
    /// Jobs pulled back to the queue because their machine is gone.
    pub requeued: Vec<JobUid>,
}

impl ScheduleOutcome {
    pub fn is_noop(&self) -> bool {
        self.changed_jobs.is_empty() && self.changed_machines.is_empty()
    }
}

/// Orchestrates the three placement policies over a round.
pub struct SchedulingAlgorithm {
    cost: Arc<dyn CostFunction>,
    config: AlgorithmConfig,
    non_preemptive: NonPreemptive,
    blocking: BlockingReservation,
    preemptive: Preemptive,
}

struct Round<'a> {
    entries: BTreeMap<JobUid, DatabaseJobEntry>,
    costs: BTreeMap<JobUid, f64>,
    slots: BTreeMap<MachineUid, MachineSlot>,
    online: BTreeSet<MachineUid>,
    reserved: BTreeMap<MachineUid, JobUid>,
    bag: BTreeMap<String, i64>,
    outcome: ScheduleOutcome,
    input: ScheduleInput<'a>,
}

impl SchedulingAlgorithm {
    pub fn new(cost: Arc<dyn CostFunction>, config: AlgorithmConfig) -> Self {
        Self {
            cost,
            config,
            non_preemptive: NonPreemptive,
            blocking: BlockingReservation::default(),
            preemptive: Preemptive::default(),
        }
    }

    pub fn cost_function(&self) -> &dyn CostFunction {
        self.cost.as_ref()
    }

    pub fn schedule(&self, input: ScheduleInput<'_>) -> ScheduleOutcome {
        let mut round = self.prepare(input);

        let mut order: Vec<(f64, u64, JobUid)> = round
            .entries
            .values()
            .filter(|e| match e.status() {
                JobStatus::Queued => true,
                JobStatus::Paused => e
                    .assigned_machine
                    .as_ref()
                    .is_some_and(|m| round.slots.contains_key(m)),
                _ => false,
            })
            .map(|e| (round.costs[e.uid()], e.statistics.time_added, e.job.uid.clone()))
            .collect();
        order.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        for (_, _, uid) in order {
            self.place(&mut round, &uid);
        }

        self.requeue_lost(&mut round);
        self.finish(round)
    }

    fn prepare<'a>(&self, input: ScheduleInput<'a>) -> Round<'a> {
        let now = input.now;
        let mut entries = BTreeMap::new();
        let mut costs = BTreeMap::new();
        for entry in input.entries {
            costs.insert(entry.job.uid.clone(), self.cost.cost(entry, now));
            entries.insert(entry.job.uid.clone(), entry.clone());
        }

        let mut slots = BTreeMap::new();
        let mut online = BTreeSet::new();
        for machine in input.machines {
            if !machine.state.is_reachable() {
                continue;
            }
            let Some(resources) = machine.resources else {
                continue;
            };
            if machine.state == WorkMachineState::Online {
                online.insert(machine.uid.clone());
            }
            slots.insert(machine.uid.clone(), MachineSlot::new(machine.uid.clone(), resources));
        }

        let mut bag = input.special_resources.clone();
        for entry in entries.values() {
            let holds_machine = match entry.status() {
                JobStatus::Running | JobStatus::Paused => entry.assigned_machine.as_ref(),
                _ => None,
            };
            let Some(machine) = holds_machine else {
                continue;
            };
            for (tag, qty) in entry.job.special_resource_demand() {
                *bag.entry(tag).or_insert(0) -= qty;
            }
            let Some(slot) = slots.get_mut(machine) else {
                continue;
            };
            if entry.status() == JobStatus::Running {
                slot.running.push(PlacedJob {
                    uid: entry.job.uid.clone(),
                    cost: costs[entry.uid()],
                    preemptible: entry.job.is_preemptible(),
                    resources: entry.job.required_resources(),
                });
            } else {
                slot.paused.push(entry.job.uid.clone());
            }
        }

        Round {
            entries,
            costs,
            slots,
            online,
            reserved: BTreeMap::new(),
            bag,
            outcome: ScheduleOutcome::default(),
            input,
        }
    }

    fn place(&self, round: &mut Round<'_>, uid: &str) {
        let Some(entry) = round.entries.get(uid).cloned() else {
            return;
        };
        let cost = round.costs[uid];
        let urgent = entry.job.priority() == JobPriority::Urgent;
        let resuming = entry.status() == JobStatus::Paused;

        // Paused jobs keep their special resources.
        let demand = if resuming {
            BTreeMap::new()
        } else {
            entry.job.special_resource_demand()
        };
        if !take_special(&mut round.bag, &demand) {
            info!(job = %uid, "special resources exhausted; job stays queued");
            round.outcome.left_waiting.push(uid.to_string());
            return;
        }

        let candidate = Candidate {
            uid: uid.to_string(),
            cost,
            required: if resuming {
                entry.job.required_resources().compute_part()
            } else {
                entry.job.required_resources()
            },
        };

        let eligible: Vec<MachineUid> = if resuming {
            entry.assigned_machine.iter().cloned().collect()
        } else {
            round.online.iter().cloned().collect()
        };
        let eligible: Vec<MachineUid> = eligible
            .into_iter()
            .filter(|m| urgent || round.reserved.get(m).is_none_or(|holder| holder == uid))
            .collect();
        let machines: Vec<&MachineSlot> = eligible.iter().filter_map(|m| round.slots.get(m)).collect();

        if let Some(assignment) = self.non_preemptive.assign_machine(&candidate, &machines) {
            debug!(job = %uid, machine = %assignment.machine, cost, "placed without preemption");
            start(round, &entry, &candidate, &assignment.machine);
            return;
        }

        if self.config.preemption_enabled && cost <= self.cost.preempting_threshold() {
            if let Some(assignment) = self.preemptive.assign_machine(&candidate, &machines) {
                for victim in &assignment.victims {
                    pause(round, victim, &assignment.machine);
                    info!(victim = %victim, preemptor = %uid, machine = %assignment.machine, "job preempted");
                    round.outcome.preemptions.push(Preemption {
                        victim: victim.clone(),
                        preemptor: uid.to_string(),
                        machine: assignment.machine.clone(),
                    });
                }
                start(round, &entry, &candidate, &assignment.machine);
                return;
            }
        }

        give_back_special(&mut round.bag, &demand);

        if self.config.blocking_enabled && cost <= self.cost.blocking_threshold() {
            let unreserved: Vec<&MachineSlot> = machines
                .iter()
                .copied()
                .filter(|m| !round.reserved.contains_key(&m.uid))
                .collect();
            if let Some(assignment) = self.blocking.assign_machine(&candidate, &unreserved) {
                info!(job = %uid, machine = %assignment.machine, "machine reserved");
                round.reserved.insert(assignment.machine.clone(), uid.to_string());
                round.outcome.reservations.push(Reservation {
                    job: uid.to_string(),
                    machine: assignment.machine,
                });
                round.outcome.left_waiting.push(uid.to_string());
                return;
            }
        }

        info!(job = %uid, cost, "no feasible placement; job keeps waiting");
        round.outcome.left_waiting.push(uid.to_string());
    }

    fn requeue_lost(&self, round: &mut Round<'_>) {
        let lost: Vec<JobUid> = round
            .entries
            .values()
            .filter(|e| matches!(e.status(), JobStatus::Running | JobStatus::Paused))
            .filter(|e| {
                e.assigned_machine
                    .as_ref()
                    .is_none_or(|m| !round.slots.contains_key(m))
            })
            .map(|e| e.job.uid.clone())
            .collect();
        for uid in lost {
            if let Some(entry) = round.entries.get_mut(&uid) {
                info!(job = %uid, machine = ?entry.assigned_machine, "machine lost; job requeued");
                entry.job.status = JobStatus::Queued;
                entry.assigned_machine = None;
                round.outcome.requeued.push(uid);
            }
        }
    }

    fn finish(&self, round: Round<'_>) -> ScheduleOutcome {
        let Round {
            entries,
            slots,
            mut outcome,
            input,
            ..
        } = round;

        for before in input.entries {
            if let Some(after) = entries.get(before.uid()) {
                if after.status() != before.status() || after.assigned_machine != before.assigned_machine {
                    outcome.changed_jobs.push(after.clone());
                }
            }
        }
        for machine in input.machines {
            let mut updated = machine.clone();
            if let Some(slot) = slots.get(&machine.uid) {
                if machine.resources != Some(slot.resources) {
                    updated.resources = Some(slot.resources);
                    outcome.changed_machines.push(updated.clone());
                }
            }
            outcome.machines.push(updated);
        }
        outcome.entries = entries.into_values().collect();
        outcome
    }
}

impl Default for SchedulingAlgorithm {
    fn default() -> Self {
        Self::new(Arc::new(PriorityAgingCost::default()), AlgorithmConfig::default())
    }
}

fn take_special(bag: &mut BTreeMap<String, i64>, demand: &BTreeMap<String, i64>) -> bool {
    let fits = demand
        .iter()
        .all(|(tag, qty)| bag.get(tag).copied().unwrap_or(0) >= *qty);
    if fits {
        for (tag, qty) in demand {
            *bag.entry(tag.clone()).or_insert(0) -= qty;
        }
    }
    fits
}

fn give_back_special(bag: &mut BTreeMap<String, i64>, demand: &BTreeMap<String, i64>) {
    for (tag, qty) in demand {
        *bag.entry(tag.clone()).or_insert(0) += qty;
    }
}

/// Mark `entry` running on `machine` and take `candidate.required` there.
fn start(round: &mut Round<'_>, entry: &DatabaseJobEntry, candidate: &Candidate, machine: &str) {
    if let Some(slot) = round.slots.get_mut(machine) {
        slot.resources.allocate(candidate.required, false);
        slot.paused.retain(|p| *p != candidate.uid);
        slot.running.push(PlacedJob {
            uid: candidate.uid.clone(),
            cost: candidate.cost,
            preemptible: entry.job.is_preemptible(),
            resources: entry.job.required_resources(),
        });
    }
    if let Some(e) = round.entries.get_mut(&candidate.uid) {
        e.job.status = JobStatus::Running;
        e.assigned_machine = Some(machine.to_string());
    }
}

/// Pause `victim`, releasing its cpu and memory but not its swap.
fn pause(round: &mut Round<'_>, victim: &str, machine: &str) {
    if let Some(slot) = round.slots.get_mut(machine) {
        if let Some(pos) = slot.running.iter().position(|j| j.uid == victim) {
            let job = slot.running.remove(pos);
            slot.resources.deallocate(job.resources.compute_part());
            slot.paused.push(job.uid);
        }
    }
    if let Some(e) = round.entries.get_mut(victim) {
        e.job.status = JobStatus::Paused;
    }
}

/// Total resources held on each machine by `entries`.
pub fn held_per_machine(entries: &[DatabaseJobEntry]) -> BTreeMap<MachineUid, ResourceAllocation> {
    let mut held: BTreeMap<MachineUid, ResourceAllocation> = BTreeMap::new();
    for entry in entries {
        if let Some(machine) = &entry.assigned_machine {
            *held.entry(machine.clone()).or_default() += entry.held_resources();
        }
    }
    held
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcenter_core::{
        DockerConstraints, DockerContext, Job, SchedulingConstraints, WorkMachineResources,
    };

    const GB: i64 = 1024;

    fn entry(uid: &str, priority: JobPriority, cpu: i64, mem_gb: i64, added: u64) -> DatabaseJobEntry {
        let job = Job {
            uid: uid.to_string(),
            owner_id: "alice".to_string(),
            email: None,
            scheduling_constraints: SchedulingConstraints {
                priority,
                is_preemptible: true,
                special_resources: vec![],
            },
            docker_constraints: DockerConstraints {
                cpu_threads: cpu,
                memory_mb: mem_gb * GB,
            },
            docker_context: DockerContext {
                dockerfile_source: "FROM busybox".to_string(),
                mounts: vec![],
            },
            status: JobStatus::Queued,
            label: None,
        };
        DatabaseJobEntry::new(job, added)
    }

    fn machine(uid: &str) -> WorkMachine {
        WorkMachine::new(
            uid,
            WorkMachineResources::new(ResourceAllocation::new(4, 16 * GB, 16 * GB)),
        )
    }

    fn run(entries: &[DatabaseJobEntry], machines: &[WorkMachine], bag: &BTreeMap<String, i64>) -> ScheduleOutcome {
        SchedulingAlgorithm::default().schedule(ScheduleInput {
            entries,
            machines,
            special_resources: bag,
            now: 0,
        })
    }

    /// Apply an outcome as the driver would.
    fn apply(outcome: &ScheduleOutcome) -> (Vec<DatabaseJobEntry>, Vec<WorkMachine>) {
        (outcome.entries.clone(), outcome.machines.clone())
    }

    fn status_of(outcome: &ScheduleOutcome, uid: &str) -> JobStatus {
        outcome.entries.iter().find(|e| e.uid() == uid).unwrap().status()
    }

    #[test]
    fn places_queued_job_on_idle_machine() {
        let entries = vec![entry("a", JobPriority::Low, 4, 16, 0)];
        let machines = vec![machine("wm-1")];

        let outcome = run(&entries, &machines, &BTreeMap::new());
        assert_eq!(status_of(&outcome, "a"), JobStatus::Running);
        assert_eq!(outcome.changed_jobs.len(), 1);
        assert_eq!(
            outcome.changed_machines[0].resources.unwrap().free,
            ResourceAllocation::zero()
        );
    }

    #[test]
    fn second_round_is_a_noop() {
        let entries = vec![
            entry("a", JobPriority::Low, 4, 16, 0),
            entry("b", JobPriority::Low, 4, 16, 1),
        ];
        let machines = vec![machine("wm-1")];

        let first = run(&entries, &machines, &BTreeMap::new());
        assert_eq!(status_of(&first, "a"), JobStatus::Running);
        assert_eq!(status_of(&first, "b"), JobStatus::Queued);

        let (entries, machines) = apply(&first);
        let second = run(&entries, &machines, &BTreeMap::new());
        assert!(second.is_noop());
    }

    #[test]
    fn older_job_wins_a_cost_tie() {
        let hour = 3600;
        let entries = vec![
            entry("young", JobPriority::Low, 4, 16, 10 * hour),
            entry("old", JobPriority::Low, 4, 16, 5 * hour),
        ];
        // Both have aged past the cap, so their costs are equal.
        let outcome = SchedulingAlgorithm::default().schedule(ScheduleInput {
            entries: &entries,
            machines: &[machine("wm-1")],
            special_resources: &BTreeMap::new(),
            now: 100 * hour,
        });
        assert_eq!(status_of(&outcome, "old"), JobStatus::Running);
        assert_eq!(status_of(&outcome, "young"), JobStatus::Queued);
    }

    #[test]
    fn urgent_preempts_low() {
        let mut low = entry("low", JobPriority::Low, 4, 16, 0);
        low.job.status = JobStatus::Running;
        low.assigned_machine = Some("wm-1".into());
        let mut m = machine("wm-1");
        m.resources.as_mut().unwrap().allocate(low.job.required_resources(), false);

        let entries = vec![low, entry("urgent", JobPriority::Urgent, 4, 16, 1)];
        let outcome = run(&entries, &[m], &BTreeMap::new());

        assert_eq!(status_of(&outcome, "low"), JobStatus::Paused);
        assert_eq!(status_of(&outcome, "urgent"), JobStatus::Running);
        assert_eq!(outcome.preemptions.len(), 1);
        // The paused job keeps its swap.
        let res = outcome.machines[0].resources.unwrap();
        assert_eq!(res.free, ResourceAllocation::zero());
    }

    #[test]
    fn preemption_can_be_disabled() {
        let mut low = entry("low", JobPriority::Low, 4, 16, 0);
        low.job.status = JobStatus::Running;
        low.assigned_machine = Some("wm-1".into());
        let mut m = machine("wm-1");
        m.resources.as_mut().unwrap().allocate(low.job.required_resources(), false);
        let entries = vec![low, entry("urgent", JobPriority::Urgent, 4, 16, 1)];

        let algorithm = SchedulingAlgorithm::new(
            Arc::new(PriorityAgingCost::default()),
            AlgorithmConfig {
                blocking_enabled: true,
                preemption_enabled: false,
            },
        );
        let outcome = algorithm.schedule(ScheduleInput {
            entries: &entries,
            machines: &[m],
            special_resources: &BTreeMap::new(),
            now: 0,
        });
        assert_eq!(status_of(&outcome, "low"), JobStatus::Running);
        assert_eq!(status_of(&outcome, "urgent"), JobStatus::Queued);
        // URGENT falls back to a reservation.
        assert_eq!(outcome.reservations.len(), 1);
    }

    #[test]
    fn reservation_blocks_later_non_urgent_jobs() {
        let mut medium = entry("m1", JobPriority::Medium, 2, 8, 0);
        medium.job.status = JobStatus::Running;
        medium.assigned_machine = Some("wm-1".into());
        let mut m = machine("wm-1");
        m.resources.as_mut().unwrap().allocate(medium.job.required_resources(), false);

        let entries = vec![
            medium,
            entry("high", JobPriority::High, 4, 16, 1),
            entry("m2", JobPriority::Medium, 2, 8, 2),
        ];
        let outcome = run(&entries, &[m], &BTreeMap::new());

        assert_eq!(status_of(&outcome, "high"), JobStatus::Queued);
        assert_eq!(status_of(&outcome, "m2"), JobStatus::Queued);
        assert_eq!(
            outcome.reservations,
            vec![Reservation {
                job: "high".into(),
                machine: "wm-1".into()
            }]
        );
    }

    #[test]
    fn special_resources_gate_placement() {
        let mut a = entry("a", JobPriority::Low, 1, 1, 0);
        a.job.scheduling_constraints.special_resources = vec!["A".into()];
        let mut b = entry("b", JobPriority::Low, 1, 1, 1);
        b.job.scheduling_constraints.special_resources = vec!["A".into()];
        let bag = BTreeMap::from([("A".to_string(), 1)]);

        let outcome = run(&[a, b], &[machine("wm-1")], &bag);
        assert_eq!(status_of(&outcome, "a"), JobStatus::Running);
        assert_eq!(status_of(&outcome, "b"), JobStatus::Queued);
    }

    #[test]
    fn unknown_special_resource_never_runs() {
        let mut a = entry("a", JobPriority::Urgent, 1, 1, 0);
        a.job.scheduling_constraints.special_resources = vec!["gpu".into()];
        let outcome = run(&[a], &[machine("wm-1")], &BTreeMap::new());
        assert_eq!(status_of(&outcome, "a"), JobStatus::Queued);
    }

    #[test]
    fn jobs_on_lost_machines_are_requeued() {
        let mut a = entry("a", JobPriority::Low, 1, 1, 0);
        a.job.status = JobStatus::Running;
        a.assigned_machine = Some("wm-gone".into());
        let mut offline = machine("wm-gone");
        offline.state = WorkMachineState::Offline;

        let outcome = run(&[a], &[offline], &BTreeMap::new());
        assert_eq!(status_of(&outcome, "a"), JobStatus::Queued);
        assert_eq!(outcome.requeued, vec!["a".to_string()]);
        assert!(outcome.entries[0].assigned_machine.is_none());
    }

    #[test]
    fn retired_machines_keep_their_jobs_but_get_no_new_ones() {
        let mut a = entry("a", JobPriority::Low, 1, 1, 0);
        a.job.status = JobStatus::Running;
        a.assigned_machine = Some("wm-1".into());
        let mut retired = machine("wm-1");
        retired.state = WorkMachineState::Retired;
        retired.resources.as_mut().unwrap().allocate(a.job.required_resources(), false);

        let outcome = run(&[a, entry("b", JobPriority::Low, 1, 1, 1)], &[retired], &BTreeMap::new());
        assert_eq!(status_of(&outcome, "a"), JobStatus::Running);
        assert_eq!(status_of(&outcome, "b"), JobStatus::Queued);
        assert!(outcome.requeued.is_empty());
    }

    #[test]
    fn paused_job_resumes_on_its_own_machine() {
        let mut p = entry("p", JobPriority::Low, 4, 16, 0);
        p.job.status = JobStatus::Paused;
        p.assigned_machine = Some("wm-1".into());
        let mut own = machine("wm-1");
        own.resources.as_mut().unwrap().allocate(p.held_resources(), false);

        // wm-0 is idle and sorts first, but the job may only resume at home.
        let outcome = run(&[p], &[machine("wm-0"), own], &BTreeMap::new());
        let resumed = &outcome.entries[0];
        assert_eq!(resumed.status(), JobStatus::Running);
        assert_eq!(resumed.assigned_machine.as_deref(), Some("wm-1"));
    }

    #[test]
    fn held_per_machine_sums_running_and_paused() {
        let mut a = entry("a", JobPriority::Low, 1, 1, 0);
        a.job.status = JobStatus::Running;
        a.assigned_machine = Some("wm-1".into());
        let mut b = entry("b", JobPriority::Low, 1, 1, 0);
        b.job.status = JobStatus::Paused;
        b.assigned_machine = Some("wm-1".into());

        let held = held_per_machine(&[a, b]);
        assert_eq!(held["wm-1"], ResourceAllocation::new(1, GB, 2 * GB));
    }
}
