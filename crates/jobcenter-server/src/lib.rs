//! jobcenter-server: the central JobCenter daemon.
//!
//! ```text
//!  jc / workers ──control socket──► ServerHandler ──► Database ──► SchedulerDriver ──► workers
//!                                                        │
//!                                                        └──► statistics API (optional)
//! ```

pub mod error;
pub mod handler;
pub mod notifier;
pub mod service;

pub use error::{ServerError, ServerResult};
pub use handler::ServerHandler;
pub use notifier::LogNotifier;
pub use service::JobCenter;
