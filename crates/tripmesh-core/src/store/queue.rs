//! Durable mutation queue
//!
//! One row per pending outbound operation. Rows are keyed by an autoincrement
//! id so iteration order is creation order (the FIFO the drain relies on),
//! with a status multimap index for counts and status scans. Rows are never
//! deleted on failure, only marked, so nothing is silently dropped; completed
//! rows can be compacted away explicitly.

use redb::{ReadableMultimapTable, ReadableTable};
use tracing::debug;
use ulid::Ulid;

use super::{Store, QUEUE_STATUS_IDX, SYNC_QUEUE_TABLE};
use crate::error::MeshError;
use crate::types::{MutationStatus, QueuedMutation};

impl Store {
    /// Append a mutation to the queue.
    ///
    /// Assigns the next queue id, stamps `created_at`, mints the idempotency
    /// key, persists the row as `Pending`, and signals the background-sync
    /// trigger. Returns the stored mutation.
    pub fn enqueue_mutation(&self, mut mutation: QueuedMutation) -> Result<QueuedMutation, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            let mut index = write_txn.open_multimap_table(QUEUE_STATUS_IDX)?;

            let next_id = table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(1);
            mutation.id = next_id;
            mutation.status = MutationStatus::Pending;
            mutation.created_at = chrono::Utc::now().timestamp_millis();
            if mutation.idempotency_key.is_empty() {
                mutation.idempotency_key = Ulid::new().to_string();
            }

            let data = serde_json::to_vec(&mutation)?;
            table.insert(next_id, data.as_slice())?;
            index.insert(MutationStatus::Pending.as_str(), next_id)?;
        }
        write_txn.commit()?;

        debug!(
            id = mutation.id,
            path = %mutation.resource_path,
            "Enqueued mutation"
        );
        self.sync_signal().notify_one();
        Ok(mutation)
    }

    /// Load a queued mutation by id. Returns `None` if unknown.
    pub fn load_mutation(&self, id: u64) -> Result<Option<QueuedMutation>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(SYNC_QUEUE_TABLE)?;

        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All mutations awaiting replay (`Pending` plus earlier `Failed`),
    /// in creation order.
    pub fn replayable_mutations(&self) -> Result<Vec<QueuedMutation>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(SYNC_QUEUE_TABLE)?;

        let mut mutations = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let mutation: QueuedMutation = serde_json::from_slice(value.value())?;
            if mutation.status != MutationStatus::Completed {
                mutations.push(mutation);
            }
        }
        Ok(mutations)
    }

    /// Mark a mutation `Completed` after a confirmed replay.
    ///
    /// Completed mutations are never replayed again.
    pub fn mark_completed(&self, id: u64) -> Result<(), MeshError> {
        self.transition(id, MutationStatus::Completed, false)
    }

    /// Mark a mutation `Failed` and bump its retry count.
    ///
    /// The row is retained for the next drain pass.
    pub fn mark_failed(&self, id: u64) -> Result<(), MeshError> {
        self.transition(id, MutationStatus::Failed, true)
    }

    fn transition(
        &self,
        id: u64,
        to: MutationStatus,
        bump_retry: bool,
    ) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            let mut index = write_txn.open_multimap_table(QUEUE_STATUS_IDX)?;

            let mut mutation: QueuedMutation = match table.get(id)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => {
                    return Err(MeshError::InvalidOperation(format!(
                        "no queued mutation with id {}",
                        id
                    )))
                }
            };

            index.remove(mutation.status.as_str(), id)?;
            mutation.status = to;
            if bump_retry {
                mutation.retry_count += 1;
            }
            index.insert(mutation.status.as_str(), id)?;

            let data = serde_json::to_vec(&mutation)?;
            table.insert(id, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Count of mutations with the given status, via the status index.
    pub fn count_by_status(&self, status: MutationStatus) -> Result<usize, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let index = read_txn.open_multimap_table(QUEUE_STATUS_IDX)?;

        let mut count = 0;
        for entry in index.get(status.as_str())? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Mutations not yet confirmed by the backend ("N changes pending").
    pub fn pending_count(&self) -> Result<usize, MeshError> {
        Ok(self.count_by_status(MutationStatus::Pending)?
            + self.count_by_status(MutationStatus::Failed)?)
    }

    /// Delete rows already confirmed by the backend. Pending and failed rows
    /// are never touched. Returns the number of rows removed.
    pub fn compact_completed(&self) -> Result<usize, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let removed;
        {
            let mut table = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            let mut index = write_txn.open_multimap_table(QUEUE_STATUS_IDX)?;

            let mut completed_ids = Vec::new();
            for entry in index.get(MutationStatus::Completed.as_str())? {
                completed_ids.push(entry?.value());
            }
            for id in &completed_ids {
                table.remove(*id)?;
                index.remove(MutationStatus::Completed.as_str(), *id)?;
            }
            removed = completed_ids.len();
        }
        write_txn.commit()?;

        if removed > 0 {
            debug!(removed, "Compacted completed mutations");
        }
        Ok(removed)
    }
}
