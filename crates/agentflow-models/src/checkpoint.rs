//! Durable task snapshots and the recovery-point stack.
//!
//! Checkpoint payloads are JSON with an explicit schema version so the
//! encoding can migrate forward without breaking stored snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::task::Task;

/// Current checkpoint payload schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointCodecError {
    #[error("unsupported checkpoint schema version: {0}")]
    UnsupportedSchema(u32),
    #[error("invalid checkpoint state: {0}")]
    InvalidState(#[from] serde_json::Error),
}

/// Durable snapshot of a task's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: i64,
    pub schema_version: u32,
    /// JSON-encoded task snapshot.
    pub state: Value,
}

impl Checkpoint {
    /// Snapshot a task into a new checkpoint.
    pub fn from_task(task: &Task) -> Result<Self, CheckpointCodecError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            created_at: crate::now_millis(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            state: serde_json::to_value(task)?,
        })
    }

    /// Decode the snapshot back into a task, rejecting unknown future
    /// schema versions.
    pub fn decode_task(&self) -> Result<Task, CheckpointCodecError> {
        if self.schema_version == 0 || self.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointCodecError::UnsupportedSchema(self.schema_version));
        }
        Ok(serde_json::from_value(self.state.clone())?)
    }
}

/// Stacked pointer to a checkpoint plus metadata, used to unwind execution.
/// Forms an ordered stack per task: push on create/restore, pop on rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryPoint {
    pub id: String,
    pub task_id: String,
    pub checkpoint_id: String,
    /// JSON-encoded task snapshot at the time the point was created.
    pub state: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl RecoveryPoint {
    pub fn new(task_id: impl Into<String>, checkpoint_id: impl Into<String>, state: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            checkpoint_id: checkpoint_id.into(),
            state,
            timestamp: crate::now_millis(),
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDefinition;

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut task = Task::from_definition(TaskDefinition::new("t1", "do the thing"));
        task.start("claude");

        let checkpoint = Checkpoint::from_task(&task).unwrap();
        assert_eq!(checkpoint.task_id, "t1");
        assert_eq!(checkpoint.schema_version, CHECKPOINT_SCHEMA_VERSION);

        let restored = checkpoint.decode_task().unwrap();
        assert_eq!(restored, task);
    }

    #[test]
    fn test_checkpoint_rejects_future_schema() {
        let task = Task::from_definition(TaskDefinition::new("t1", "x"));
        let mut checkpoint = Checkpoint::from_task(&task).unwrap();
        checkpoint.schema_version = CHECKPOINT_SCHEMA_VERSION + 1;

        let err = checkpoint.decode_task().unwrap_err();
        assert!(matches!(err, CheckpointCodecError::UnsupportedSchema(_)));
    }
}
