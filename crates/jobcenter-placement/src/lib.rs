//! jobcenter-placement: where a job goes, and at whose expense.
//!
//! Placement decisions for one candidate job at a time. The scheduling
//! algorithm (`jobcenter-scheduler`) drives these policies over a whole
//! round; this crate only answers "which machine, and who must yield".
//!
//! # Components
//!
//! - **`cost`**: job cost and the blocking / preempting thresholds
//! - **`policy`**: machine view, candidate, shared "cheapest machine" skeleton
//! - **`nonpreemptive`**: fit into free capacity
//! - **`blocking`**: reserve a machine until running jobs end
//! - **`preemptive`**: pause costlier jobs to make room
//! - **`subset`**: bounded subset search used by the last two

pub mod blocking;
pub mod cost;
pub mod nonpreemptive;
pub mod policy;
pub mod preemptive;
pub mod subset;

pub use blocking::BlockingReservation;
pub use cost::{CostFunction, PriorityAgingCost};
pub use nonpreemptive::NonPreemptive;
pub use policy::{Assignment, Candidate, MachineSlot, PlacedJob, PlacementPolicy, fit_cost};
pub use preemptive::Preemptive;
