//! Persistent local store using redb.
//!
//! This module provides the device-local durable state for:
//! - Cached trip entities (groups, expenses, members, document metadata)
//! - The durable mutation queue awaiting backend replay
//! - Trip packages (full offline snapshots per group)
//! - Node identity (endpoint secret key)
//!
//! All tables are created in a single init transaction before the `Store`
//! handle is returned, so callers never observe a half-initialized schema.
//! The store is the single shared mutable resource on-device; operations are
//! serialized per transaction by redb. Cross-collection atomicity is NOT
//! provided: a cache put and a queue put for one logical action are two
//! transactions, and the crash window between them is an accepted, bounded
//! inconsistency.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, MultimapTableDefinition, ReadableTable, TableDefinition};
use tokio::sync::Notify;

use crate::error::MeshError;

mod entities;
mod packages;
mod queue;

// Entity collections (key: entity id, value: JSON row)
const GROUPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
const EXPENSES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("expenses");
const MEMBERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("members");
const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const TRIP_PACKAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("trip_packages");

// Secondary indices (one-to-many)
const EXPENSE_GROUP_IDX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("expense_group_idx");
const MEMBER_GROUP_IDX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("member_group_idx");
const DOCUMENT_OWNER_IDX: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("document_owner_idx");

// Mutation queue (key: autoincrement id) and its status index
const SYNC_QUEUE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("sync_queue");
const QUEUE_STATUS_IDX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("queue_status_idx");

// Node-local identity (endpoint secret key)
const NODE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node");

/// Device-local durable store
#[derive(Clone)]
pub struct Store {
    db: Arc<RwLock<Database>>,
    sync_wake: Arc<Notify>,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Creates the parent directory and every table up-front.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(GROUPS_TABLE)?;
            let _ = write_txn.open_table(EXPENSES_TABLE)?;
            let _ = write_txn.open_table(MEMBERS_TABLE)?;
            let _ = write_txn.open_table(DOCUMENTS_TABLE)?;
            let _ = write_txn.open_table(TRIP_PACKAGES_TABLE)?;
            let _ = write_txn.open_multimap_table(EXPENSE_GROUP_IDX)?;
            let _ = write_txn.open_multimap_table(MEMBER_GROUP_IDX)?;
            let _ = write_txn.open_multimap_table(DOCUMENT_OWNER_IDX)?;
            let _ = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            let _ = write_txn.open_multimap_table(QUEUE_STATUS_IDX)?;
            let _ = write_txn.open_table(NODE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            sync_wake: Arc::new(Notify::new()),
        })
    }

    /// Get a reference to the shared database handle
    pub(crate) fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    /// The background-sync trigger.
    ///
    /// `enqueue_mutation` notifies this so the coordinator picks up new
    /// pending work without an explicit UI action.
    pub fn sync_signal(&self) -> Arc<Notify> {
        self.sync_wake.clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Node Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Endpoint secret key storage key (there's only one endpoint per device)
    const ENDPOINT_SECRET_KEY: &'static str = "endpoint_secret_key";

    /// Save the endpoint's secret key so the device keeps a stable peer id
    /// across restarts.
    pub fn save_endpoint_secret_key(&self, secret_key: &[u8; 32]) -> Result<(), MeshError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(NODE_TABLE)?;
            table.insert(Self::ENDPOINT_SECRET_KEY, secret_key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the endpoint's secret key.
    ///
    /// Returns `None` if this device has never bound an endpoint.
    pub fn load_endpoint_secret_key(&self) -> Result<Option<[u8; 32]>, MeshError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NODE_TABLE)?;

        Ok(table.get(Self::ENDPOINT_SECRET_KEY)?.map(|v| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(v.value());
            arr
        }))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::Store;
    use tempfile::TempDir;

    pub fn create_test_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let store = Store::open(&db_path).unwrap();
        (store, temp_dir)
    }
}
