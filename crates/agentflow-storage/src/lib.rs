//! AgentFlow Storage - persistence layer for the orchestration core
//!
//! This crate provides the state store, using redb as the embedded
//! single-file database. Each entity type gets its own substore over a
//! shared database handle; composite string keys act as secondary indexes.
//!
//! # Architecture
//!
//! [`Storage`] aggregates the substores and implements the synchronous
//! [`StateStore`] trait. [`AsyncStateStore`] wraps any `StateStore` for
//! async callers. A remote Postgres backend for distributed deployments is
//! available behind the `remote-postgres` feature.

pub mod checkpoint;
pub mod range_utils;
pub mod session;
pub mod store;
pub mod task;
pub mod usage;

#[cfg(feature = "remote-postgres")]
pub mod remote;

use anyhow::Result;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

pub use checkpoint::CheckpointStorage;
pub use session::SessionStorage;
pub use store::{AsyncStateStore, StateStore};
pub use task::TaskStorage;
pub use usage::UsageStorage;

#[cfg(feature = "remote-postgres")]
pub use remote::PgStateStore;

use agentflow_models::{Checkpoint, Session, Task, TaskStatus, UsageRecord};

/// Central storage manager that initializes all substores.
pub struct Storage {
    db: Arc<Database>,
    pub sessions: SessionStorage,
    pub tasks: TaskStorage,
    pub usage: UsageStorage,
    pub checkpoints: CheckpointStorage,
}

impl Storage {
    /// Open (or create) the database file at `path` and initialize all
    /// required tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);
        Self::with_database(db)
    }

    /// Fully in-memory storage for tests and ephemeral runs.
    pub fn in_memory() -> Result<Self> {
        let db = Arc::new(
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?,
        );
        Self::with_database(db)
    }

    fn with_database(db: Arc<Database>) -> Result<Self> {
        let sessions = SessionStorage::new(db.clone())?;
        let tasks = TaskStorage::new(db.clone())?;
        let usage = UsageStorage::new(db.clone())?;
        let checkpoints = CheckpointStorage::new(db.clone())?;

        Ok(Self {
            db,
            sessions,
            tasks,
            usage,
            checkpoints,
        })
    }

    /// Get a reference to the underlying database
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}

impl StateStore for Storage {
    fn put_session(&self, session: &Session) -> Result<()> {
        self.sessions.put(session)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.sessions.get(id)
    }

    fn delete_session(&self, id: &str) -> Result<bool> {
        self.sessions.delete(id)
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        self.sessions.list()
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        self.tasks.put(task)
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.tasks.get(id)
    }

    fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.tasks.list_by_status(status)
    }

    fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>> {
        self.tasks.list_for_session(session_id)
    }

    fn delete_task(&self, id: &str) -> Result<bool> {
        self.tasks.delete(id)
    }

    fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage.append(record)
    }

    fn query_usage_since(&self, provider_id: &str, since: i64) -> Result<Vec<UsageRecord>> {
        self.usage.query_since(provider_id, since)
    }

    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.insert(checkpoint)
    }

    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.get(id)
    }

    fn latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.latest_for_task(task_id)
    }

    fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        self.checkpoints.list_for_task(task_id)
    }

    fn delete_checkpoint(&self, id: &str) -> Result<bool> {
        self.checkpoints.delete(id)
    }

    fn cleanup_checkpoints(&self, older_than: i64) -> Result<usize> {
        self.checkpoints.cleanup(older_than)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_models::TaskDefinition;
    use tempfile::tempdir;

    #[test]
    fn test_open_on_disk() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("state.db");

        let storage = Storage::open(&db_path).unwrap();
        let task = Task::from_definition(TaskDefinition::new("t1", "hello"));
        storage.put_task(&task).unwrap();

        drop(storage);

        // Reopen and verify the write survived.
        let storage = Storage::open(&db_path).unwrap();
        let loaded = storage.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.id, "t1");
    }

    #[tokio::test]
    async fn test_async_facade() {
        let storage: Arc<dyn StateStore> = Arc::new(Storage::in_memory().unwrap());
        let store = AsyncStateStore::new(storage);

        let task = Task::from_definition(TaskDefinition::new("t1", "hello"));
        store.put_task(task.clone()).await.unwrap();

        let loaded = store.get_task("t1".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded, task);

        let pending = store.list_tasks_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
