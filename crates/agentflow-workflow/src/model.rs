//! Workflow definitions, executions and events.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Step kinds supported by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Activity,
    Signal,
    Timer,
    Decision,
    ChildWorkflow,
}

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    /// Registered activity to invoke; required for `Activity` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,
    /// Signal name emitted by `Signal` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    /// Workflow started by `ChildWorkflow` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_workflow: Option<String>,
    /// Timer duration, activity deadline or approval wait, in ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Per-step retry override; falls back to the workflow policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub requires_checkpoint: bool,
    #[serde(default)]
    pub requires_human_approval: bool,
}

impl WorkflowStep {
    pub fn activity(id: impl Into<String>, activity_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Activity,
            activity_name: Some(activity_name.into()),
            signal_name: None,
            child_workflow: None,
            timeout_ms: None,
            retry_policy: None,
            requires_checkpoint: false,
            requires_human_approval: false,
        }
    }

    pub fn timer(id: impl Into<String>, timeout_ms: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Timer,
            activity_name: None,
            signal_name: None,
            child_workflow: None,
            timeout_ms: Some(timeout_ms),
            retry_policy: None,
            requires_checkpoint: false,
            requires_human_approval: false,
        }
    }

    pub fn signal(id: impl Into<String>, signal_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Signal,
            activity_name: None,
            signal_name: Some(signal_name.into()),
            child_workflow: None,
            timeout_ms: None,
            retry_policy: None,
            requires_checkpoint: false,
            requires_human_approval: false,
        }
    }

    pub fn decision(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Decision,
            activity_name: None,
            signal_name: None,
            child_workflow: None,
            timeout_ms: None,
            retry_policy: None,
            requires_checkpoint: false,
            requires_human_approval: false,
        }
    }

    pub fn child(id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::ChildWorkflow,
            activity_name: None,
            signal_name: None,
            child_workflow: Some(workflow_name.into()),
            timeout_ms: None,
            retry_policy: None,
            requires_checkpoint: false,
            requires_human_approval: false,
        }
    }

    pub fn with_checkpoint(mut self) -> Self {
        self.requires_checkpoint = true;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_human_approval = true;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Retry policy with exponential backoff and non-retryable error names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    pub maximum_attempts: u32,
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 60_000,
            maximum_attempts: 3,
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the 1-based attempt:
    /// `min(maximum_interval, initial_interval * coefficient^(attempt-1))`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let multiplier = self
            .backoff_coefficient
            .powi(attempt.saturating_sub(1) as i32);
        ((self.initial_interval_ms as f64 * multiplier) as u64).min(self.maximum_interval_ms)
    }

    /// Whether the error message names a non-retryable error.
    pub fn is_non_retryable(&self, message: &str) -> bool {
        self.non_retryable_errors.iter().any(|e| message.contains(e))
    }
}

/// When checkpoints are written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointStrategy {
    #[default]
    EveryStep,
    Manual,
    None,
}

/// A registered workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub checkpoint_strategy: CheckpointStrategy,
    #[serde(default)]
    pub enable_hitl: bool,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            version: "1".to_string(),
            steps,
            retry_policy: RetryPolicy::default(),
            checkpoint_strategy: CheckpointStrategy::default(),
            enable_hitl: false,
        }
    }

    pub fn with_hitl(mut self) -> Self {
        self.enable_hitl = true;
        self
    }

    pub fn with_checkpoint_strategy(mut self, strategy: CheckpointStrategy) -> Self {
        self.checkpoint_strategy = strategy;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Async activity handler: input JSON in, output JSON out.
pub type ActivityHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Execution status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub current_step_index: usize,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Accumulated step outputs keyed by step id.
    #[serde(default)]
    pub state: Value,
    pub input: Value,
}

impl WorkflowExecution {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            run_id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: WorkflowStatus::Running,
            current_step_index: 0,
            started_at: agentflow_models::now_millis(),
            completed_at: None,
            error: None,
            state: Value::Object(Default::default()),
            input,
        }
    }
}

/// Checkpoint of one execution after a step boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub workflow_id: String,
    /// Index of the next step to run on replay.
    pub step_index: usize,
    pub created_at: i64,
    pub state: Value,
}

/// Event kinds emitted to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    StepStarted { step_id: String },
    StepCompleted { step_id: String },
    StepFailed { step_id: String, message: String },
    SignalEmitted { name: String },
    SignalReceived { name: String },
    ApprovalRequested { request_id: String, step_id: String },
    ApprovalSubmitted { request_id: String, approved: bool },
    Completed,
    Failed { message: String },
    Cancelled,
}

/// Event envelope on the engine's feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEvent {
    pub workflow_id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
}

/// A human decision on a pending approval request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            initial_interval_ms: 100,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 500,
            maximum_attempts: 5,
            non_retryable_errors: vec![],
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 400);
        assert_eq!(policy.delay_ms(4), 500);
    }

    #[test]
    fn test_non_retryable_matching() {
        let policy = RetryPolicy {
            non_retryable_errors: vec!["InvalidInput".to_string()],
            ..Default::default()
        };
        assert!(policy.is_non_retryable("InvalidInput: missing field"));
        assert!(!policy.is_non_retryable("transient glitch"));
    }

    #[test]
    fn test_definition_serde_roundtrip() {
        let definition = WorkflowDefinition::new(
            "deploy",
            vec![
                WorkflowStep::activity("build", "run-build").with_checkpoint(),
                WorkflowStep::timer("cooldown", 500),
                WorkflowStep::signal("notify", "build-done"),
            ],
        )
        .with_hitl();

        let json = serde_json::to_string(&definition).unwrap();
        let decoded: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, definition);
    }
}
