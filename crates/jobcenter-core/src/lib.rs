//! jobcenter-core: shared model for the JobCenter scheduler.
//!
//! - **`resources`**: `(cpu, memory, swap)` algebra and machine capacity
//! - **`job`**: jobs, lifecycle status, statistics, database entries
//! - **`machine`**: work machines and their availability
//! - **`config`**: server/worker YAML configuration
//! - **`error`**: core errors and the user-visible error kinds

pub mod config;
pub mod error;
pub mod job;
pub mod machine;
pub mod resources;

pub use config::{DatabaseConfig, EmailConfig, ServerConfig, SshConfig, WorkerConfig};
pub use error::{CoreError, CoreResult, ErrorCode, ErrorKind};
pub use job::*;
pub use machine::{MachineUid, WorkMachine, WorkMachineState};
pub use resources::{ResourceAllocation, WorkMachineResources};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A fresh opaque uid.
pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}
