//! StateStore — redb-backed persistence for labgrid.
//!
//! Provides typed CRUD over machines, sites and global resources, plus the
//! single-transaction row transitions the lock service relies on. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Reads run in their own read transaction and never wait for writers, so a
//! listing may be stale by the time the caller acts on it.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
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

    /// Create an ephemeral in-memory state store (for testing).
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.open_table(SITES).map_err(map_err!(Table))?;
        txn.open_table(GLOBAL_RESOURCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Insert or update a machine.
    pub fn put_machine(&self, machine: &Machine) -> StateResult<()> {
        machine.validate()?;
        self.put(MACHINES, &machine.name, machine)?;
        debug!(machine = %machine.name, "machine stored");
        Ok(())
    }

    pub fn get_machine(&self, name: &str) -> StateResult<Option<Machine>> {
        self.get(MACHINES, name)
    }

    /// List all machines, ordered by name.
    pub fn list_machines(&self) -> StateResult<Vec<Machine>> {
        self.list(MACHINES)
    }

    /// Delete a machine by name. Returns true if it existed.
    pub fn delete_machine(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(MACHINES, name)?;
        debug!(machine = %name, existed, "machine deleted");
        Ok(existed)
    }

    // ── Sites ──────────────────────────────────────────────────────

    /// Insert or update a site.
    pub fn put_site(&self, site: &Site) -> StateResult<()> {
        site.validate()?;
        self.put(SITES, &site.name, site)?;
        debug!(site = %site.name, "site stored");
        Ok(())
    }

    pub fn get_site(&self, name: &str) -> StateResult<Option<Site>> {
        self.get(SITES, name)
    }

    /// List all sites, ordered by name.
    pub fn list_sites(&self) -> StateResult<Vec<Site>> {
        self.list(SITES)
    }

    pub fn delete_site(&self, name: &str) -> StateResult<bool> {
        self.delete(SITES, name)
    }

    /// Read-modify-write a site inside one write transaction.
    ///
    /// Returns `Ok(None)` when the site does not exist. If `f` fails, or the
    /// modified site no longer validates, nothing is written.
    pub fn modify_site<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Site) -> StateResult<R>,
    ) -> StateResult<Option<R>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(SITES).map_err(map_err!(Table))?;
            let current: Option<Site> = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let Some(mut site) = current else {
                return Ok(None);
            };
            result = f(&mut site)?;
            site.validate()?;
            let bytes = encode(&site)?;
            table
                .insert(name, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(site = %name, "site modified");
        Ok(Some(result))
    }

    // ── Global resources ───────────────────────────────────────────

    /// Insert or update a global resource.
    pub fn put_resource(&self, resource: &GlobalResource) -> StateResult<()> {
        resource.validate()?;
        self.put(GLOBAL_RESOURCES, &resource.name, resource)?;
        debug!(resource = %resource.name, "global resource stored");
        Ok(())
    }

    pub fn get_resource(&self, name: &str) -> StateResult<Option<GlobalResource>> {
        self.get(GLOBAL_RESOURCES, name)
    }

    /// List all global resources, ordered by name.
    pub fn list_resources(&self) -> StateResult<Vec<GlobalResource>> {
        self.list(GLOBAL_RESOURCES)
    }

    pub fn delete_resource(&self, name: &str) -> StateResult<bool> {
        self.delete(GLOBAL_RESOURCES, name)
    }

    /// Transition one resource idle → locked for `job`, in one transaction.
    ///
    /// Returns the locked resource, or `None` if it is missing or not idle.
    pub fn lock_resource(&self, name: &str, job: JobId) -> StateResult<Option<GlobalResource>> {
        self.transition(name, |res| res.lock(job))
    }

    /// Transition one resource locked → idle. Returns true if it was locked.
    pub fn release_resource(&self, name: &str) -> StateResult<bool> {
        Ok(self.transition(name, GlobalResource::release)?.is_some())
    }

    /// Release every resource locked by `job`. Returns how many were released.
    pub fn release_resources_for_job(&self, job: JobId) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(GLOBAL_RESOURCES).map_err(map_err!(Table))?;
            let mut held = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let res: GlobalResource = decode(value.value())?;
                if res.status == ResourceStatus::Locked && res.job_id == Some(job) {
                    held.push(res);
                }
            }
            count = held.len() as u32;
            for mut res in held {
                res.release();
                let bytes = encode(&res)?;
                table
                    .insert(res.name.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job, released = count, "resources released for job");
        Ok(count)
    }

    /// Apply a state transition to one resource row. The row is written only
    /// when `apply` reports a change.
    fn transition(
        &self,
        name: &str,
        apply: impl FnOnce(&mut GlobalResource) -> bool,
    ) -> StateResult<Option<GlobalResource>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let changed;
        {
            let mut table = txn.open_table(GLOBAL_RESOURCES).map_err(map_err!(Table))?;
            let current: Option<GlobalResource> = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let Some(mut res) = current else {
                return Ok(None);
            };
            if !apply(&mut res) {
                return Ok(None);
            }
            let bytes = encode(&res)?;
            table
                .insert(name, bytes.as_slice())
                .map_err(map_err!(Write))?;
            changed = res;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(resource = %name, status = ?changed.status, job = ?changed.job_id, "resource transitioned");
        Ok(Some(changed))
    }
}
