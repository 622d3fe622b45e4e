//! StateStore: redb-backed persistence for the Arena control plane.
//!
//! Provides typed operations over workloads, allocations, reservations and
//! the node ledger. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::epoch_secs;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

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
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert a new workload. Returns false (and writes nothing) if the id
    /// is already taken; existing records are only changed through
    /// [`transition`](Self::transition) and [`update_workload`](Self::update_workload).
    pub fn insert_workload(&self, workload: &Workload) -> StateResult<bool> {
        let value = serde_json::to_vec(workload).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let exists = table
                .get(workload.id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(workload.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workload_id = %workload.id, inserted, "workload inserted");
        Ok(inserted)
    }

    /// Get a workload by id.
    pub fn get_workload(&self, id: &str) -> StateResult<Option<Workload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let workload: Workload =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// List all workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    /// List workloads currently in any of the given statuses.
    pub fn list_workloads_by_status(
        &self,
        statuses: &[WorkloadStatus],
    ) -> StateResult<Vec<Workload>> {
        Ok(self
            .list_workloads()?
            .into_iter()
            .filter(|w| statuses.contains(&w.status))
            .collect())
    }

    /// Delete a workload record. Returns true if it existed.
    pub fn delete_workload(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        release_in(&txn, id)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workload_id = %id, existed, "workload deleted");
        Ok(existed)
    }

    /// Compare-and-swap the status of a workload.
    ///
    /// Commits only if the stored status still equals `from`. Returns whether
    /// the swap occurred; a missing workload or a status mismatch is `false`.
    pub fn transition(
        &self,
        id: &str,
        from: WorkloadStatus,
        to: WorkloadStatus,
        message: Option<&str>,
    ) -> StateResult<bool> {
        self.transition_with(id, from, to, message, |_| {})
            .map(|applied| applied.is_some())
    }

    /// Like [`transition`](Self::transition), additionally applying `mutate`
    /// to the record in the same write. Returns the committed record when the
    /// swap occurred.
    ///
    /// Entering `stopped` stamps `stopped_at`, entering `expired` stamps
    /// `expired_at`. Entering a terminal status releases the workload's
    /// allocations and reservation in the same transaction.
    pub fn transition_with<F>(
        &self,
        id: &str,
        from: WorkloadStatus,
        to: WorkloadStatus,
        message: Option<&str>,
        mutate: F,
    ) -> StateResult<Option<Workload>>
    where
        F: FnOnce(&mut Workload),
    {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let current: Option<Workload> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            match current {
                Some(mut workload) if workload.status == from => {
                    mutate(&mut workload);
                    workload.status = to;
                    workload.status_message = message.map(str::to_string);
                    workload.updated_at = now;
                    match to {
                        WorkloadStatus::Stopped => workload.stopped_at = Some(now),
                        WorkloadStatus::Expired => workload.expired_at = Some(now),
                        _ => {}
                    }
                    let value = serde_json::to_vec(&workload).map_err(map_err!(Serialize))?;
                    table
                        .insert(id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(workload)
                }
                Some(workload) => {
                    debug!(
                        workload_id = %id,
                        expected = %from,
                        actual = %workload.status,
                        "transition not applied"
                    );
                    None
                }
                None => {
                    debug!(workload_id = %id, "transition on missing workload");
                    None
                }
            }
        };

        let Some(workload) = updated else {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        };

        let released = if to.is_terminal() {
            release_in(&txn, id)?
        } else {
            0
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workload_id = %id, %from, %to, released, "transition committed");
        Ok(Some(workload))
    }

    /// Apply a field update that does not touch `status`.
    ///
    /// Any change the closure makes to `status` is discarded. Returns false
    /// if the workload does not exist.
    pub fn update_workload<F>(&self, id: &str, update: F) -> StateResult<bool>
    where
        F: FnOnce(&mut Workload),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let current: Option<Workload> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            found = current.is_some();
            if let Some(mut workload) = current {
                let status = workload.status;
                update(&mut workload);
                workload.status = status;
                let value = serde_json::to_vec(&workload).map_err(map_err!(Serialize))?;
                table
                    .insert(id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(found)
    }

    /// Stamp `last_reconciled` on a workload.
    pub fn touch_reconciled(&self, id: &str, now: u64) -> StateResult<bool> {
        self.update_workload(id, |w| w.last_reconciled = Some(now))
    }

    // ── Allocations ────────────────────────────────────────────────

    /// All allocations held by one workload, ordered by port name.
    pub fn allocations_for(&self, workload_id: &str) -> StateResult<Vec<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        let mut allocations: Vec<Allocation> = decode_all(&table)?
            .into_iter()
            .filter(|a: &Allocation| a.workload_id == workload_id)
            .collect();
        allocations.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        Ok(allocations)
    }

    /// Every live allocation in the ledger.
    pub fn list_allocations(&self) -> StateResult<Vec<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    /// The reservation a workload holds, if any.
    pub fn reservation_for(&self, workload_id: &str) -> StateResult<Option<Reservation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        match table.get(workload_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let reservation: Reservation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(reservation))
            }
            None => Ok(None),
        }
    }

    /// Every live reservation in the ledger.
    pub fn list_reservations(&self) -> StateResult<Vec<Reservation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    /// Run `f` against the capacity ledger inside one write transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; on `Err` nothing
    /// `f` wrote is persisted.
    pub fn ledger_txn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut LedgerTxn<'_>) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut ledger = LedgerTxn { txn: &txn };
            f(&mut ledger)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node's declared capacity.
    pub fn put_node(&self, node: &NodeCapacity) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node.name, "node stored");
        Ok(())
    }

    /// Get a node by name.
    pub fn get_node(&self, name: &str) -> StateResult<Option<NodeCapacity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeCapacity =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeCapacity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    /// Delete a node by name. Returns true if it existed.
    pub fn delete_node(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

/// Typed access to the ledger tables inside one write transaction.
pub struct LedgerTxn<'a> {
    txn: &'a WriteTransaction,
}

impl LedgerTxn<'_> {
    pub fn nodes(&self) -> StateResult<Vec<NodeCapacity>> {
        let table = self.txn.open_table(NODES).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    pub fn allocations(&self) -> StateResult<Vec<Allocation>> {
        let table = self.txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    pub fn allocations_for(&self, workload_id: &str) -> StateResult<Vec<Allocation>> {
        Ok(self
            .allocations()?
            .into_iter()
            .filter(|a| a.workload_id == workload_id)
            .collect())
    }

    pub fn reservations(&self) -> StateResult<Vec<Reservation>> {
        let table = self.txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        decode_all(&table)
    }

    pub fn insert_allocation(&mut self, allocation: &Allocation) -> StateResult<()> {
        let key = allocation.table_key();
        let value = serde_json::to_vec(allocation).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    pub fn insert_reservation(&mut self, reservation: &Reservation) -> StateResult<()> {
        let value = serde_json::to_vec(reservation).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        table
            .insert(reservation.workload_id.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Remove every allocation and the reservation of a workload.
    /// Returns the number of allocation records removed.
    pub fn release(&mut self, workload_id: &str) -> StateResult<usize> {
        release_in(self.txn, workload_id)
    }
}

/// Remove a workload's allocations and reservation within `txn`.
fn release_in(txn: &WriteTransaction, workload_id: &str) -> StateResult<usize> {
    let keys: Vec<String> = {
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        decode_all::<Allocation, _>(&table)?
            .into_iter()
            .filter(|a| a.workload_id == workload_id)
            .map(|a| a.table_key())
            .collect()
    };
    {
        let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        for key in &keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
    }
    {
        let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        table.remove(workload_id).map_err(map_err!(Write))?;
    }
    Ok(keys.len())
}

/// Deserialize every value in a table.
fn decode_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(item);
    }
    Ok(results)
}
