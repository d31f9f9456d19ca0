//! Workflow checkpoint persistence.
//!
//! An in-memory backend for tests and a durable backend that rides the
//! shared state store, encoding workflow checkpoints as task checkpoints
//! keyed by workflow id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use agentflow_models::{CHECKPOINT_SCHEMA_VERSION, Checkpoint};
use agentflow_storage::StateStore;

use crate::error::{Result, WorkflowError};
use crate::model::WorkflowCheckpoint;

/// Pluggable checkpoint persistence for workflow executions.
pub trait WorkflowCheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>>;
    /// Checkpoints for one workflow, descending by creation time.
    fn list(&self, workflow_id: &str) -> Result<Vec<WorkflowCheckpoint>>;
}

/// Volatile backend.
#[derive(Default)]
pub struct InMemoryWorkflowCheckpoints {
    checkpoints: Mutex<HashMap<String, WorkflowCheckpoint>>,
}

impl InMemoryWorkflowCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowCheckpointStore for InMemoryWorkflowCheckpoints {
    fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>> {
        Ok(self.checkpoints.lock().get(id).cloned())
    }

    fn list(&self, workflow_id: &str) -> Result<Vec<WorkflowCheckpoint>> {
        let mut checkpoints: Vec<WorkflowCheckpoint> = self
            .checkpoints
            .lock()
            .values()
            .filter(|c| c.workflow_id == workflow_id)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }
}

/// Durable backend over the shared state store. The workflow id occupies
/// the checkpoint's task slot, so the store's task index serves both.
pub struct StateStoreWorkflowCheckpoints {
    store: Arc<dyn StateStore>,
}

impl StateStoreWorkflowCheckpoints {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn encode(checkpoint: &WorkflowCheckpoint) -> Result<Checkpoint> {
        Ok(Checkpoint {
            id: checkpoint.id.clone(),
            task_id: checkpoint.workflow_id.clone(),
            session_id: None,
            created_at: checkpoint.created_at,
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            state: serde_json::to_value(checkpoint)?,
        })
    }

    fn decode(checkpoint: Checkpoint) -> Result<WorkflowCheckpoint> {
        if checkpoint.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(WorkflowError::InvalidState(format!(
                "unsupported checkpoint schema version: {}",
                checkpoint.schema_version
            )));
        }
        Ok(serde_json::from_value(checkpoint.state)?)
    }
}

impl WorkflowCheckpointStore for StateStoreWorkflowCheckpoints {
    fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        let encoded = Self::encode(checkpoint)?;
        Ok(self.store.insert_checkpoint(&encoded)?)
    }

    fn load(&self, id: &str) -> Result<Option<WorkflowCheckpoint>> {
        match self.store.get_checkpoint(id)? {
            Some(checkpoint) => Ok(Some(Self::decode(checkpoint)?)),
            None => Ok(None),
        }
    }

    fn list(&self, workflow_id: &str) -> Result<Vec<WorkflowCheckpoint>> {
        self.store
            .list_checkpoints(workflow_id)?
            .into_iter()
            .map(Self::decode)
            .collect()
    }
}
