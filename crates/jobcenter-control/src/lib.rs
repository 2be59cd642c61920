//! jobcenter-control: the local control socket shared by server and worker.
//!
//! ```text
//!  jc / jobcenterd -k / scheduler           server or worker daemon
//!  ┌───────────────┐   u64 len + YAML    ┌──────────────────────────┐
//!  │ ControlClient │ ──────────────────► │ ControlServer            │
//!  │  Transport    │   RawRequest        │  peer creds → Caller     │
//!  │  (unix | ssh) │ ◄────────────────── │  CommandSet::decode      │
//!  └───────────────┘   Response          │  CommandHandler::handle  │
//!                                        └──────────────────────────┘
//! ```

pub mod command;
pub mod auth;
pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod server;
pub mod transport;

pub use auth::{Caller, GroupAuthorizer, current_username};
pub use client::ControlClient;
pub use command::*;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{RawRequest, Response};
pub use server::{CommandHandler, ControlServer, DEFAULT_IO_TIMEOUT};
pub use transport::Transport;
