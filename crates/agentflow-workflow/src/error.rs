//! Error types for the workflow engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Activity name required")]
    ActivityNameRequired,

    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    #[error("activity failed: {0}")]
    Activity(String),

    #[error("step {step_id} failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("approval rejected for step {0}")]
    ApprovalRejected(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("invalid workflow state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;
