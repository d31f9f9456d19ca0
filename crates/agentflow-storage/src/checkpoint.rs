//! Checkpoint storage with a per-task time index.
//!
//! Index keys are "{task_id}:{created_at:020}:{checkpoint_id}" so
//! latest-for-task and descending listings are range scans.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use agentflow_models::Checkpoint;

use crate::range_utils::prefix_range;

const CHECKPOINT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Index: "{task_id}:{created_at:020}:{checkpoint_id}" -> checkpoint_id
const CHECKPOINT_TASK_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("checkpoint_task_idx");

/// Checkpoint persistence over the shared redb database.
#[derive(Clone)]
pub struct CheckpointStorage {
    db: Arc<Database>,
}

impl CheckpointStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(CHECKPOINT_TABLE)?;
        write_txn.open_table(CHECKPOINT_TASK_INDEX)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn index_key(checkpoint: &Checkpoint) -> String {
        format!(
            "{}:{:020}:{}",
            checkpoint.task_id, checkpoint.created_at, checkpoint.id
        )
    }

    /// Insert a checkpoint and its index entry. Durable once this returns.
    pub fn insert(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_vec(checkpoint)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINT_TABLE)?;
            table.insert(checkpoint.id.as_str(), data.as_slice())?;

            let mut task_idx = write_txn.open_table(CHECKPOINT_TASK_INDEX)?;
            let key = Self::index_key(checkpoint);
            task_idx.insert(key.as_str(), checkpoint.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Checkpoint>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHECKPOINT_TABLE)?;

        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Most recent checkpoint for a task, if any.
    pub fn latest_for_task(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let read_txn = self.db.begin_read()?;
        let task_idx = read_txn.open_table(CHECKPOINT_TASK_INDEX)?;

        let (start, end) = prefix_range(&format!("{}:", task_id));
        let mut last_id: Option<String> = None;
        for entry in task_idx.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            last_id = Some(entry.1.value().to_string());
        }

        match last_id {
            Some(id) => {
                let table = read_txn.open_table(CHECKPOINT_TABLE)?;
                match table.get(id.as_str())? {
                    Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    /// All checkpoints for a task, descending by creation time.
    pub fn list_for_task(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let read_txn = self.db.begin_read()?;
        let task_idx = read_txn.open_table(CHECKPOINT_TASK_INDEX)?;
        let table = read_txn.open_table(CHECKPOINT_TABLE)?;

        let (start, end) = prefix_range(&format!("{}:", task_id));
        let mut checkpoints = Vec::new();
        for entry in task_idx.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let id = entry.1.value();
            if let Some(value) = table.get(id)? {
                checkpoints.push(serde_json::from_slice::<Checkpoint>(value.value())?);
            }
        }
        checkpoints.reverse();
        Ok(checkpoints)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(CHECKPOINT_TABLE)?;
            let previous: Option<Checkpoint> = match table.remove(id)? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };

            if let Some(prev) = previous {
                let mut task_idx = write_txn.open_table(CHECKPOINT_TASK_INDEX)?;
                let key = Self::index_key(&prev);
                task_idx.remove(key.as_str())?;
                true
            } else {
                false
            }
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Delete all checkpoints created before `older_than` (epoch millis).
    /// Returns the number of deleted checkpoints.
    pub fn cleanup(&self, older_than: i64) -> Result<usize> {
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(CHECKPOINT_TABLE)?;

            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let checkpoint: Checkpoint = serde_json::from_slice(value.value())?;
                if checkpoint.created_at < older_than {
                    expired.push(key.value().to_string());
                }
            }
            expired
        };

        let count = expired.len();
        for id in expired {
            self.delete(&id)?;
        }
        Ok(count)
    }
}
