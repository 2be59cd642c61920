//! jobcenter-worker: runs the jobs a JobCenter server dispatches.
//!
//! ```text
//!  server ──control socket──► WorkerHandler ──► ContainerRuntime (docker)
//!    ▲                                                 │ die events
//!    └──── JobFinished / JobCrashed ◄── lifecycle ◄────┘
//! ```

pub mod docker;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod resources;
pub mod runtime;
pub mod service;

pub use docker::DockerCliRuntime;
pub use error::{WorkerError, WorkerResult};
pub use handler::{ExitDisposition, WorkerHandler};
pub use lifecycle::{LifecycleEvent, ReportRetry, Reporter, ServerReporter};
pub use runtime::{ContainerExit, ContainerId, ContainerRuntime, FakeRuntime};
pub use service::WorkerDaemon;
