//! Request envelope and response.

use jobcenter_core::{ErrorCode, ErrorKind};
use serde::{Deserialize, Serialize};

/// Wire request: `{type_name, username, command}`. `command` is decoded
/// later through the [`CommandSet`](crate::CommandSet) registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    pub type_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub command: serde_yaml::Value,
}

/// Wire response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub result_string: String,
    pub is_success: bool,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Response {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result_string: result.into(),
            is_success: true,
            uid: None,
            error: None,
        }
    }

    pub fn ok_with_uid(result: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            ..Self::ok(result)
        }
    }

    pub fn error(code: impl Into<ErrorCode>, result: impl Into<String>) -> Self {
        Self {
            result_string: result.into(),
            is_success: false,
            uid: None,
            error: Some(code.into()),
        }
    }

    pub fn permission_denied(username: &str, type_name: &str) -> Self {
        Self::error(
            ErrorKind::Permission,
            format!("{username} is not allowed to run {type_name}"),
        )
    }
}
