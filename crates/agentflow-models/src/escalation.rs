//! Attempt history, stuck classification and escalation decisions.

use serde::{Deserialize, Serialize};

/// Scheduling priority of a task, used by escalation policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Coarse complexity estimate of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Trivial,
    Simple,
    #[default]
    Medium,
    Complex,
    Epic,
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One attempt observed by the stuck detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub task_id: String,
    pub attempt_number: u32,
    pub timestamp: i64,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

/// Why a task is considered stalled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    IdenticalErrors,
    NoProgress,
    Timeout,
    Oscillating,
    TestFailureLoop,
}

/// Stuck detector verdict with confidence and supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StuckAssessment {
    pub is_stuck: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StuckReason>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl StuckAssessment {
    pub fn not_stuck() -> Self {
        Self {
            is_stuck: false,
            reason: None,
            confidence: 0.0,
            evidence: Vec::new(),
        }
    }

    pub fn stuck(reason: StuckReason, confidence: f64, evidence: Vec<String>) -> Self {
        Self {
            is_stuck: true,
            reason: Some(reason),
            confidence: confidence.clamp(0.0, 1.0),
            evidence,
        }
    }
}

/// Procedural promotion level for a failing task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Retry,
    DifferentApproach,
    PartialCompletion,
    HumanIntervention,
}

/// Decision produced by the escalation engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationDecision {
    pub level: EscalationLevel,
    pub reason: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub suggested_next_steps: Vec<String>,
    pub can_auto_resolve: bool,
    pub requires_human: bool,
}
