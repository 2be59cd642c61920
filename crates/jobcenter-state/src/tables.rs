//! redb table definitions for the JobCenter database.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Job entries keyed by job uid.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Work machines keyed by machine uid.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("work_machines");
