//! Dependency-graph task nodes and staged execution plans.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One node in a composite-work dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskNode {
    pub id: String,
    /// Free-form kind tag, e.g. "codegen", "test", "review".
    pub task_type: String,
    pub description: String,
    /// Estimated duration in scheduler units (milliseconds by convention).
    pub estimated_duration: u64,
    pub priority: u32,
    /// Ids of nodes that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether the node may run concurrently with its stage peers.
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Whether a thief may split this node when stealing it.
    #[serde(default)]
    pub splittable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl TaskNode {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: String::new(),
            estimated_duration: 0,
            priority: 0,
            dependencies: Vec::new(),
            parallel: true,
            splittable: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_duration(mut self, estimated_duration: u64) -> Self {
        self.estimated_duration = estimated_duration;
        self
    }

    pub fn depends_on<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn splittable(mut self) -> Self {
        self.splittable = true;
        self
    }
}

/// One barrier-delimited stage of an execution plan. Every task in a stage
/// has all dependencies satisfied by earlier stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStage {
    pub index: usize,
    pub tasks: Vec<String>,
    /// Longest estimated task duration in the stage.
    pub estimated_duration: u64,
}

/// A staged plan computed from an acyclic dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub tasks: Vec<TaskNode>,
    pub stages: Vec<PlanStage>,
    /// Critical-path estimate: sum of per-stage maxima.
    pub estimated_total_duration: u64,
    /// Total work divided by the critical path; 1.0 for a pure chain.
    pub parallelization_factor: f64,
}

impl ExecutionPlan {
    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }
}
