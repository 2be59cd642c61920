//! jobcenter-state: the database facade of the JobCenter server.
//!
//! # Architecture
//!
//! ```text
//!   writers ──atomic_update──▶ Database ──write-through──▶ StateStore (redb)
//!                                 │
//!                                 ├──▶ StatusSink::on_status_change (per transition)
//!                                 └──▶ UpdateSink::on_update        (once per commit)
//! ```
//!
//! Job entries and work machines are held in memory behind a
//! `parking_lot::RwLock` and JSON-serialized into redb tables keyed by uid.
//! The `Database` handle is `Clone` + `Send` + `Sync` and can be shared
//! across async tasks.

pub mod clock;
pub mod database;
pub mod error;
pub mod store;
pub mod tables;

pub use clock::{Clock, ManualClock, SystemClock};
pub use database::{Database, JobFilter, StatusSink, Transaction, Transition, UpdateSink};
pub use error::{StateError, StateResult};
pub use store::StateStore;
