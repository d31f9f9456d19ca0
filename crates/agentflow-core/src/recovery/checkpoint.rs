//! Checkpoint store abstraction and the checkpoint manager.
//!
//! The store trait is synchronous and pluggable: an in-memory backend for
//! development and tests, and a durable backend over the state store for
//! production. The manager enforces the per-task cap and drives the
//! optional auto-checkpoint timer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agentflow_models::{Checkpoint, Task};
use agentflow_storage::StateStore;

use crate::error::{CoreError, Result};

/// Pluggable checkpoint persistence.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<Checkpoint>>;
    /// All checkpoints, or those of one task, descending by creation time.
    fn list(&self, task_id: Option<&str>) -> Result<Vec<Checkpoint>>;
    fn delete(&self, id: &str) -> Result<bool>;
    /// Remove checkpoints created before `older_than`; returns the count.
    fn cleanup(&self, older_than: i64) -> Result<usize>;
}

/// Volatile store for development and tests.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().get(id).cloned())
    }

    fn list(&self, task_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .values()
            .filter(|c| task_id.is_none_or(|t| c.task_id == t))
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.checkpoints.lock().remove(id).is_some())
    }

    fn cleanup(&self, older_than: i64) -> Result<usize> {
        let mut checkpoints = self.checkpoints.lock();
        let before = checkpoints.len();
        checkpoints.retain(|_, c| c.created_at >= older_than);
        Ok(before - checkpoints.len())
    }
}

/// Durable store over the shared state store.
pub struct DurableCheckpointStore {
    store: Arc<dyn StateStore>,
}

impl DurableCheckpointStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

impl CheckpointStore for DurableCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        Ok(self.store.insert_checkpoint(checkpoint)?)
    }

    fn load(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.store.get_checkpoint(id)?)
    }

    fn list(&self, task_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        match task_id {
            Some(task_id) => Ok(self.store.list_checkpoints(task_id)?),
            None => Err(CoreError::Validation(
                "durable checkpoint listing requires a task id".to_string(),
            )),
        }
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete_checkpoint(id)?)
    }

    fn cleanup(&self, older_than: i64) -> Result<usize> {
        Ok(self.store.cleanup_checkpoints(older_than)?)
    }
}

/// Creates, prunes and restores checkpoints.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    max_per_task: usize,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, max_per_task: usize) -> Self {
        Self {
            store,
            max_per_task: max_per_task.max(1),
        }
    }

    /// Snapshot a task. Enforces the per-task cap by deleting the oldest
    /// checkpoints above the limit.
    pub fn checkpoint(&self, task: &Task) -> Result<String> {
        let checkpoint = Checkpoint::from_task(task)
            .map_err(|e| CoreError::Execution(format!("checkpoint encode failed: {e}")))?;
        self.store.save(&checkpoint)?;
        debug!(task_id = %task.id, checkpoint_id = %checkpoint.id, "Checkpoint saved");

        let existing = self.store.list(Some(&task.id))?;
        if existing.len() > self.max_per_task {
            for stale in &existing[self.max_per_task..] {
                self.store.delete(&stale.id)?;
            }
        }
        Ok(checkpoint.id)
    }

    /// Restore the task state from a checkpoint, or fail with
    /// `CheckpointNotFound`.
    pub fn restore(&self, checkpoint_id: &str) -> Result<Task> {
        let checkpoint = self
            .store
            .load(checkpoint_id)?
            .ok_or_else(|| CoreError::CheckpointNotFound(checkpoint_id.to_string()))?;
        checkpoint
            .decode_task()
            .map_err(|e| CoreError::Execution(format!("checkpoint decode failed: {e}")))
    }

    pub fn get_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.store.list(Some(task_id))?.into_iter().next())
    }

    /// Checkpoints for a task, descending by creation time.
    pub fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        self.store.list(Some(task_id))
    }

    pub fn cleanup(&self, older_than: i64) -> Result<usize> {
        self.store.cleanup(older_than)
    }

    /// Periodically checkpoint whatever `get_state` yields. The timer
    /// stops when `get_state` returns None or the handle is aborted, so it
    /// never outlives the owning task.
    pub fn start_auto_checkpoint<F>(
        self: &Arc<Self>,
        interval: Duration,
        get_state: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Option<Task> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                match get_state() {
                    Some(task) => {
                        if let Err(error) = manager.checkpoint(&task) {
                            warn!(task_id = %task.id, error = %error, "Auto-checkpoint failed");
                        }
                    }
                    None => break,
                }
            }
        })
    }
}
