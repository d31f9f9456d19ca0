//! Dual state-store interface: a synchronous trait for embedded backends
//! and an async wrapper that moves calls onto the blocking pool.

use anyhow::Result;
use std::sync::Arc;

use agentflow_models::{Checkpoint, Session, Task, TaskStatus, UsageRecord};

/// Synchronous state-store surface. Every successful return guarantees
/// durability of the write.
pub trait StateStore: Send + Sync {
    // Sessions
    fn put_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn delete_session(&self, id: &str) -> Result<bool>;
    fn list_sessions(&self) -> Result<Vec<Session>>;

    // Tasks
    fn put_task(&self, task: &Task) -> Result<()>;
    fn get_task(&self, id: &str) -> Result<Option<Task>>;
    fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>>;
    fn delete_task(&self, id: &str) -> Result<bool>;

    // Usage, append-only
    fn append_usage(&self, record: &UsageRecord) -> Result<()>;
    fn query_usage_since(&self, provider_id: &str, since: i64) -> Result<Vec<UsageRecord>>;

    // Checkpoints
    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>>;
    fn latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>>;
    fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>>;
    fn delete_checkpoint(&self, id: &str) -> Result<bool>;
    fn cleanup_checkpoints(&self, older_than: i64) -> Result<usize>;
}

/// Async facade over any [`StateStore`]. redb transactions are blocking, so
/// calls are dispatched to tokio's blocking pool rather than holding up a
/// runtime worker.
#[derive(Clone)]
pub struct AsyncStateStore {
    inner: Arc<dyn StateStore>,
}

impl AsyncStateStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self { inner }
    }

    /// The wrapped synchronous store.
    pub fn sync(&self) -> Arc<dyn StateStore> {
        self.inner.clone()
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateStore) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(inner.as_ref()))
            .await
            .map_err(|e| anyhow::anyhow!("state store task panicked: {e}"))?
    }

    pub async fn put_session(&self, session: Session) -> Result<()> {
        self.run(move |s| s.put_session(&session)).await
    }

    pub async fn get_session(&self, id: String) -> Result<Option<Session>> {
        self.run(move |s| s.get_session(&id)).await
    }

    pub async fn delete_session(&self, id: String) -> Result<bool> {
        self.run(move |s| s.delete_session(&id)).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.run(|s| s.list_sessions()).await
    }

    pub async fn put_task(&self, task: Task) -> Result<()> {
        self.run(move |s| s.put_task(&task)).await
    }

    pub async fn get_task(&self, id: String) -> Result<Option<Task>> {
        self.run(move |s| s.get_task(&id)).await
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.run(move |s| s.list_tasks_by_status(status)).await
    }

    pub async fn list_tasks_for_session(&self, session_id: String) -> Result<Vec<Task>> {
        self.run(move |s| s.list_tasks_for_session(&session_id)).await
    }

    pub async fn delete_task(&self, id: String) -> Result<bool> {
        self.run(move |s| s.delete_task(&id)).await
    }

    pub async fn append_usage(&self, record: UsageRecord) -> Result<()> {
        self.run(move |s| s.append_usage(&record)).await
    }

    pub async fn query_usage_since(
        &self,
        provider_id: String,
        since: i64,
    ) -> Result<Vec<UsageRecord>> {
        self.run(move |s| s.query_usage_since(&provider_id, since))
            .await
    }

    pub async fn insert_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        self.run(move |s| s.insert_checkpoint(&checkpoint)).await
    }

    pub async fn get_checkpoint(&self, id: String) -> Result<Option<Checkpoint>> {
        self.run(move |s| s.get_checkpoint(&id)).await
    }

    pub async fn latest_checkpoint(&self, task_id: String) -> Result<Option<Checkpoint>> {
        self.run(move |s| s.latest_checkpoint(&task_id)).await
    }

    pub async fn list_checkpoints(&self, task_id: String) -> Result<Vec<Checkpoint>> {
        self.run(move |s| s.list_checkpoints(&task_id)).await
    }

    pub async fn delete_checkpoint(&self, id: String) -> Result<bool> {
        self.run(move |s| s.delete_checkpoint(&id)).await
    }

    pub async fn cleanup_checkpoints(&self, older_than: i64) -> Result<usize> {
        self.run(move |s| s.cleanup_checkpoints(older_than)).await
    }
}
