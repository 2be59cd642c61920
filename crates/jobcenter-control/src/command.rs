//! Command registry keyed by `type_name`.
//!
//! A [`CommandSet`] is a tagged enum of every command one daemon accepts.
//! The `command_set!` macro generates the enum together with the
//! `type_name` lookup table, so adding a command is one line.

use jobcenter_core::{Job, JobUid, ResourceAllocation, SshConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::RawRequest;

pub trait CommandSet: Sized + Send + 'static {
    /// Tag written as `type_name` on the wire.
    fn type_name(&self) -> &'static str;

    /// Only members of the admin group may run this command.
    fn requires_admin(&self) -> bool;

    /// Every tag this set understands.
    fn type_names() -> &'static [&'static str];

    fn decode(type_name: &str, body: serde_yaml::Value) -> ProtocolResult<Self>;

    fn encode(&self) -> ProtocolResult<serde_yaml::Value>;

    fn is_kill(&self) -> bool {
        self.type_name() == KILL_COMMAND
    }

    fn to_request(&self, username: &str) -> ProtocolResult<RawRequest> {
        Ok(RawRequest {
            type_name: self.type_name().to_string(),
            username: username.to_string(),
            command: self.encode()?,
        })
    }

    fn from_request(request: &RawRequest) -> ProtocolResult<Self> {
        Self::decode(&request.type_name, request.command.clone())
    }
}

pub const KILL_COMMAND: &str = "KillCommand";

/// Commands without fields may arrive with `command: null`.
pub(crate) fn normalize_body(body: serde_yaml::Value) -> serde_yaml::Value {
    if body.is_null() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        body
    }
}

macro_rules! command_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident($ty:ty) => $tag:literal, admin: $admin:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis enum $name {
            $( $variant($ty) ),+
        }

        impl $crate::command::CommandSet for $name {
            fn type_name(&self) -> &'static str {
                match self {
                    $( $name::$variant(_) => $tag ),+
                }
            }

            fn requires_admin(&self) -> bool {
                match self {
                    $( $name::$variant(_) => $admin ),+
                }
            }

            fn type_names() -> &'static [&'static str] {
                &[$( $tag ),+]
            }

            fn decode(
                type_name: &str,
                body: serde_yaml::Value,
            ) -> $crate::error::ProtocolResult<Self> {
                let body = $crate::command::normalize_body(body);
                match type_name {
                    $( $tag => Ok($name::$variant(serde_yaml::from_value(body)?)), )+
                    other => Err($crate::error::ProtocolError::UnknownCommand(other.to_string())),
                }
            }

            fn encode(&self) -> $crate::error::ProtocolResult<serde_yaml::Value> {
                match self {
                    $( $name::$variant(c) => Ok(serde_yaml::to_value(c)?), )+
                }
            }
        }
    };
}

// ── Server commands ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddJobCommand {
    pub job: Job,
}

/// Addressed by `uid`, or by `label` among the caller's jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSelector {
    #[serde(default)]
    pub uid: Option<JobUid>,
    #[serde(default)]
    pub label: Option<String>,
}

impl JobSelector {
    pub fn uid(uid: impl Into<JobUid>) -> Self {
        Self {
            uid: Some(uid.into()),
            label: None,
        }
    }

    pub fn label(label: impl Into<String>) -> Self {
        Self {
            uid: None,
            label: Some(label.into()),
        }
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        match (&self.uid, &self.label) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ProtocolError::InvalidCommand(
                "exactly one of uid or label is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelJobCommand {
    #[serde(flatten)]
    pub selector: JobSelector,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJobCommand {
    #[serde(flatten)]
    pub selector: JobSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkMachineCommand {
    /// Assigned by the server when absent.
    #[serde(default)]
    pub uid: Option<String>,
    pub resources: ResourceAllocation,
    #[serde(default)]
    pub connection: Option<SshConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterWorkMachineCommand {
    pub uid: String,
    /// Go straight to OFFLINE instead of RETIRED.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinishedCommand {
    pub uid: JobUid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCrashedCommand {
    pub uid: JobUid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillCommand {}

command_set! {
    /// Everything the server's control socket accepts.
    pub enum ServerCommand {
        AddJob(AddJobCommand) => "AddJobCommand", admin: false,
        CancelJob(CancelJobCommand) => "CancelJobCommand", admin: false,
        QueryJob(QueryJobCommand) => "QueryJobCommand", admin: false,
        RegisterWorkMachine(RegisterWorkMachineCommand) => "RegisterWorkMachineCommand", admin: true,
        UnregisterWorkMachine(UnregisterWorkMachineCommand) => "UnregisterWorkMachineCommand", admin: true,
        JobFinished(JobFinishedCommand) => "JobFinishedCommand", admin: true,
        JobCrashed(JobCrashedCommand) => "JobCrashedCommand", admin: true,
        Kill(KillCommand) => "KillCommand", admin: true,
    }
}

// ── Worker commands ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJobCommand {
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseJobCommand {
    pub uid: JobUid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeJobCommand {
    pub uid: JobUid,
}

/// Worker-side cancel; always by uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillJobCommand {
    pub uid: JobUid,
}

command_set! {
    /// Everything a worker's control socket accepts. All admin-only.
    pub enum WorkerCommand {
        StartJob(StartJobCommand) => "StartJobCommand", admin: true,
        PauseJob(PauseJobCommand) => "PauseJobCommand", admin: true,
        ResumeJob(ResumeJobCommand) => "ResumeJobCommand", admin: true,
        CancelJob(KillJobCommand) => "CancelJobCommand", admin: true,
        Kill(KillCommand) => "KillCommand", admin: true,
    }
}
