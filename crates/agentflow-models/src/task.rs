//! Task definitions, runtime state and the legal status transition graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::escalation::{TaskComplexity, TaskPriority};
use crate::provider::CapabilityRequirements;

/// Lifecycle states of a task.
///
/// Progression is monotonic: `Pending -> Running -> {Completed | Failed |
/// Cancelled}` with `Running <-> Paused` allowed. Terminal states are
/// immutable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition `self -> next` is legal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }

    /// Stable string form used in storage index keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Caller-supplied description of the work to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    /// Client-provided id; submission is idempotent per id.
    pub id: String,
    pub prompt: String,
    pub project_key: String,
    pub repository_path: String,
    /// Providers to prefer, in order, when routing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<CapabilityRequirements>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub complexity: TaskComplexity,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            project_key: String::new(),
            repository_path: String::new(),
            preferred_providers: Vec::new(),
            requirements: None,
            priority: TaskPriority::default(),
            complexity: TaskComplexity::default(),
        }
    }

    pub fn with_project(mut self, key: impl Into<String>, repo: impl Into<String>) -> Self {
        self.project_key = key.into();
        self.repository_path = repo.into();
        self
    }

    pub fn with_requirements(mut self, requirements: CapabilityRequirements) -> Self {
        self.requirements = Some(requirements);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Final output of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            files_changed: Vec::new(),
            data: None,
        }
    }
}

/// Persisted runtime state of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub definition: TaskDefinition,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Completed attempt count, including the in-flight one once started.
    #[serde(default)]
    pub attempts: u32,
    /// Coarse progress in percent, reported by the executing adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
}

impl Task {
    /// Create a pending task from a definition. The task id is the
    /// definition id so that submission stays idempotent per client id.
    pub fn from_definition(definition: TaskDefinition) -> Self {
        let now = crate::now_millis();
        Self {
            id: definition.id.clone(),
            session_id: None,
            definition,
            status: TaskStatus::Pending,
            provider_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            attempts: 0,
            progress: None,
        }
    }

    /// Create a pending task with a generated id.
    pub fn anonymous(prompt: impl Into<String>) -> Self {
        Self::from_definition(TaskDefinition::new(Uuid::new_v4().to_string(), prompt))
    }

    /// Mark the task running and count a new attempt.
    pub fn start(&mut self, provider_id: impl Into<String>) {
        self.status = TaskStatus::Running;
        self.provider_id = Some(provider_id.into());
        let now = crate::now_millis();
        self.started_at = Some(now);
        self.updated_at = now;
        self.attempts += 1;
    }

    pub fn complete(&mut self, result: TaskResult) {
        self.status = TaskStatus::Completed;
        let now = crate::now_millis();
        self.completed_at = Some(now);
        self.updated_at = now;
        self.result = Some(result);
        self.progress = Some(100.0);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        let now = crate::now_millis();
        self.completed_at = Some(now);
        self.updated_at = now;
        self.error = Some(error.into());
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        let now = crate::now_millis();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn pause(&mut self) {
        self.status = TaskStatus::Paused;
        self.updated_at = crate::now_millis();
    }

    pub fn resume(&mut self) {
        self.status = TaskStatus::Running;
        self.updated_at = crate::now_millis();
    }
}
