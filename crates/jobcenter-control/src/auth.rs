//! Caller identity and the admin-group check.

use nix::unistd::{Group, Uid, User};
use tracing::debug;

/// Who sent a request, after peer-credential resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
    pub is_admin: bool,
}

/// Decides admin rights by membership of one system group.
#[derive(Debug, Clone)]
pub struct GroupAuthorizer {
    admin_group: String,
}

impl GroupAuthorizer {
    pub fn new(admin_group: impl Into<String>) -> Self {
        Self {
            admin_group: admin_group.into(),
        }
    }

    pub fn admin_group(&self) -> &str {
        &self.admin_group
    }

    /// True if `username` is literally the group's name, lists the group as
    /// a supplementary group, or has it as primary group.
    pub fn is_admin(&self, username: &str) -> bool {
        if username.is_empty() {
            return false;
        }
        if username == self.admin_group {
            return true;
        }
        let group = match Group::from_name(&self.admin_group) {
            Ok(Some(group)) => group,
            Ok(None) => {
                debug!(group = %self.admin_group, "admin group does not exist");
                return false;
            }
            Err(e) => {
                debug!(group = %self.admin_group, error = %e, "group lookup failed");
                return false;
            }
        };
        if group.mem.iter().any(|m| m == username) {
            return true;
        }
        matches!(User::from_name(username), Ok(Some(user)) if user.gid == group.gid)
    }

    pub fn caller(&self, username: String) -> Caller {
        let is_admin = self.is_admin(&username);
        Caller { username, is_admin }
    }
}

/// Resolve a numeric peer uid to a user name.
pub fn username_for_uid(uid: u32) -> Option<String> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Some(user.name),
        _ => None,
    }
}

/// Name of the user running this process.
pub fn current_username() -> String {
    username_for_uid(Uid::effective().as_raw()).unwrap_or_else(|| {
        std::env::var("USER").unwrap_or_default()
    })
}
