//! AgentFlow Models - shared data model for the orchestration core
//!
//! Pure data types exchanged between the orchestrator, schedulers, storage
//! and recovery subsystems. No I/O lives here; higher layers serialize these
//! types through the storage crate.

pub mod checkpoint;
pub mod escalation;
pub mod event;
pub mod plan;
pub mod provider;
pub mod session;
pub mod task;
pub mod usage;
pub mod worker;

pub use checkpoint::{CHECKPOINT_SCHEMA_VERSION, Checkpoint, CheckpointCodecError, RecoveryPoint};
pub use escalation::{
    AttemptOutcome, AttemptRecord, EscalationDecision, EscalationLevel, StuckAssessment,
    StuckReason, TaskComplexity, TaskPriority,
};
pub use event::{TaskEvent, TaskEventEnvelope};
pub use plan::{ExecutionPlan, PlanStage, TaskNode};
pub use provider::{
    AccessModeConfig, Capability, CapabilityRequirements, ProviderCapabilities, ProviderProfile,
    RateLimits,
};
pub use session::Session;
pub use task::{Task, TaskDefinition, TaskResult, TaskStatus};
pub use usage::{AccessMode, UsageRecord};
pub use worker::{WorkerInfo, WorkerMetrics, WorkerResources, WorkerStatus};

/// Current UTC time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh string id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
