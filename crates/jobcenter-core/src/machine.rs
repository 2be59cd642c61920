//! Work machines: the worker hosts jobs are placed on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SshConfig;
use crate::resources::WorkMachineResources;

/// Unique identifier of a work machine.
pub type MachineUid = String;

/// Availability of a work machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkMachineState {
    /// Eligible for new jobs.
    Online,
    /// No new jobs; existing ones keep running.
    Retired,
    /// No interaction at all.
    Offline,
}

impl WorkMachineState {
    /// Whether commands can still be sent to the machine.
    pub fn is_reachable(self) -> bool {
        matches!(self, WorkMachineState::Online | WorkMachineState::Retired)
    }
}

impl fmt::Display for WorkMachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkMachineState::Online => write!(f, "ONLINE"),
            WorkMachineState::Retired => write!(f, "RETIRED"),
            WorkMachineState::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// A worker host known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMachine {
    pub uid: MachineUid,
    pub state: WorkMachineState,
    /// Meaningful only while `ONLINE` or `RETIRED`.
    #[serde(default)]
    pub resources: Option<WorkMachineResources>,
    /// How the server reaches the worker's command socket.
    #[serde(default)]
    pub connection: Option<SshConfig>,
}

impl WorkMachine {
    pub fn new(uid: impl Into<MachineUid>, resources: WorkMachineResources) -> Self {
        Self {
            uid: uid.into(),
            state: WorkMachineState::Online,
            resources: Some(resources),
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: SshConfig) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Candidate for new placements.
    pub fn is_online(&self) -> bool {
        self.state == WorkMachineState::Online && self.resources.is_some()
    }
}
