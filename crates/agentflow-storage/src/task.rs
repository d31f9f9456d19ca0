//! Task storage with status and session secondary indexes.
//!
//! Index keys are composite strings "{status}:{task_id}" and
//! "{session_id}:{task_id}" so lookups by status or session are prefix
//! range scans rather than full table iterations.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use agentflow_models::{Task, TaskStatus};

use crate::range_utils::prefix_range;

const TASK_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Index: "{status}:{task_id}" -> task_id
const TASK_STATUS_INDEX: TableDefinition<&str, &str> = TableDefinition::new("task_status_idx");

/// Index: "{session_id}:{task_id}" -> task_id
const TASK_SESSION_INDEX: TableDefinition<&str, &str> = TableDefinition::new("task_session_idx");

/// Task persistence over the shared redb database.
#[derive(Clone)]
pub struct TaskStorage {
    db: Arc<Database>,
}

impl TaskStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(TASK_TABLE)?;
        write_txn.open_table(TASK_STATUS_INDEX)?;
        write_txn.open_table(TASK_SESSION_INDEX)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert or update a task and maintain both indexes in the same
    /// transaction, so a successful return guarantees a consistent view.
    pub fn put(&self, task: &Task) -> Result<()> {
        let data = serde_json::to_vec(task)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TASK_TABLE)?;

            // Drop stale index entries when the task already exists.
            let previous: Option<Task> = match table.get(task.id.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };

            table.insert(task.id.as_str(), data.as_slice())?;

            let mut status_idx = write_txn.open_table(TASK_STATUS_INDEX)?;
            if let Some(ref prev) = previous
                && prev.status != task.status
            {
                let old_key = format!("{}:{}", prev.status.as_str(), prev.id);
                status_idx.remove(old_key.as_str())?;
            }
            let status_key = format!("{}:{}", task.status.as_str(), task.id);
            status_idx.insert(status_key.as_str(), task.id.as_str())?;

            let mut session_idx = write_txn.open_table(TASK_SESSION_INDEX)?;
            if let Some(ref prev) = previous
                && prev.session_id != task.session_id
                && let Some(ref old_session) = prev.session_id
            {
                let old_key = format!("{}:{}", old_session, prev.id);
                session_idx.remove(old_key.as_str())?;
            }
            if let Some(ref session_id) = task.session_id {
                let session_key = format!("{}:{}", session_id, task.id);
                session_idx.insert(session_key.as_str(), task.id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASK_TABLE)?;

        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Tasks currently in `status`, via the status index.
    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()?;
        let status_idx = read_txn.open_table(TASK_STATUS_INDEX)?;
        let table = read_txn.open_table(TASK_TABLE)?;

        let (start, end) = prefix_range(&format!("{}:", status.as_str()));
        let mut tasks = Vec::new();
        for entry in status_idx.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let task_id = entry.1.value();
            if let Some(value) = table.get(task_id)? {
                tasks.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(tasks)
    }

    /// Tasks attached to a session, via the session index.
    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()?;
        let session_idx = read_txn.open_table(TASK_SESSION_INDEX)?;
        let table = read_txn.open_table(TASK_TABLE)?;

        let (start, end) = prefix_range(&format!("{}:", session_id));
        let mut tasks = Vec::new();
        for entry in session_idx.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let task_id = entry.1.value();
            if let Some(value) = table.get(task_id)? {
                tasks.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(tasks)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(TASK_TABLE)?;
            let previous: Option<Task> = match table.remove(id)? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };

            if let Some(prev) = previous {
                let mut status_idx = write_txn.open_table(TASK_STATUS_INDEX)?;
                let status_key = format!("{}:{}", prev.status.as_str(), prev.id);
                status_idx.remove(status_key.as_str())?;

                if let Some(ref session_id) = prev.session_id {
                    let mut session_idx = write_txn.open_table(TASK_SESSION_INDEX)?;
                    let session_key = format!("{}:{}", session_id, prev.id);
                    session_idx.remove(session_key.as_str())?;
                }
                true
            } else {
                false
            }
        };
        write_txn.commit()?;
        Ok(existed)
    }
}
