//! StateStore: redb-backed persistence for jobs and work machines.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). The [`Database`](crate::Database) facade writes every committed
//! change through to it and reloads from it on startup.

use std::path::Path;
use std::sync::Arc;

use jobcenter_core::{DatabaseJobEntry, WorkMachine};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn list<T: DeserializeOwned>(&self, def: TableDefinition<&str, &[u8]>) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(map_err!(Serialize))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn list_jobs(&self) -> StateResult<Vec<DatabaseJobEntry>> {
        self.list(JOBS)
    }

    // ── Work machines ──────────────────────────────────────────────

    pub fn list_machines(&self) -> StateResult<Vec<WorkMachine>> {
        self.list(MACHINES)
    }

    // ── Batches ────────────────────────────────────────────────────

    /// Write a set of jobs and machines in one redb transaction.
    pub fn commit<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a DatabaseJobEntry>,
        machines: impl IntoIterator<Item = &'a WorkMachine>,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (mut job_count, mut machine_count) = (0usize, 0usize);
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            for entry in jobs {
                let value = Self::encode(entry)?;
                table
                    .insert(entry.uid(), value.as_slice())
                    .map_err(map_err!(Write))?;
                job_count += 1;
            }
        }
        {
            let mut table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            for machine in machines {
                let value = Self::encode(machine)?;
                table
                    .insert(machine.uid.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                machine_count += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(jobs = job_count, machines = machine_count, "batch committed");
        Ok(())
    }
}
