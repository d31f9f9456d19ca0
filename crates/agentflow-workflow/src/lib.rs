//! AgentFlow Workflow - durable step-structured execution
//!
//! Workflows are ordered step lists executed with per-activity retries,
//! checkpoints after steps, named signals, timers, human-in-the-loop
//! approval gates and replay from any checkpoint.

pub mod engine;
pub mod error;
pub mod model;
pub mod store;

pub use engine::{WorkflowEngine, WorkflowMetricsSnapshot};
pub use error::{Result, WorkflowError};
pub use model::{
    ActivityHandler, ApprovalDecision, CheckpointStrategy, RetryPolicy, StepType,
    WorkflowCheckpoint, WorkflowDefinition, WorkflowEvent, WorkflowEventKind, WorkflowExecution,
    WorkflowStatus, WorkflowStep,
};
pub use store::{InMemoryWorkflowCheckpoints, StateStoreWorkflowCheckpoints, WorkflowCheckpointStore};
