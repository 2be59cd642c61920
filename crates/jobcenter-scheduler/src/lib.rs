//! jobcenter-scheduler: decides where jobs run and tells workers.
//!
//! # Architecture
//!
//! ```text
//! Database ──on_update──► RescheduleTrigger ──Notify──► SchedulerDriver
//!                                                         │
//!            atomic_update ◄── SchedulingAlgorithm ◄──────┤
//!                                (placement policies)     │
//!                                                         ▼
//!                                                     Dispatcher
//!                                                         │ last_status delta
//!                                                         ▼
//!                                     ProxyFactory ──► WorkerProxy (per machine)
//!                                                         │ control socket
//!                                                         ▼
//!                                                      worker
//! ```

pub mod algorithm;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod proxy;

pub use algorithm::{
    AlgorithmConfig, Preemption, Reservation, ScheduleInput, ScheduleOutcome, SchedulingAlgorithm,
    held_per_machine,
};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use driver::{DriverConfig, RescheduleTrigger, RoundReport, SchedulerDriver};
pub use error::{SchedulerError, SchedulerResult};
pub use proxy::{
    ProxyConnector, ProxyFactory, ProxyReply, SocketConnector, SocketWorkerProxy, WorkerProxy,
};
