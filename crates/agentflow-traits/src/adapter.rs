//! Agent adapter abstraction.
//!
//! The core never spawns agent processes itself; it drives an
//! [`AgentAdapter`] which yields a finite, non-restartable event stream per
//! execution. Events arrive over a bounded channel so slow consumers apply
//! backpressure to the producing adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use agentflow_models::{ProviderCapabilities, Task, TaskEvent};

use crate::error::Result;

/// Finite event sequence produced by one execution.
/// Ends with a terminal event (`Complete`, `Error` or `Interrupt`).
pub type EventStream = mpsc::Receiver<TaskEvent>;

/// Project context an adapter operates inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProjectContext {
    pub project_key: String,
    pub repository_path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Detects provider-specific rate-limit signals in raw error output.
pub trait RateLimitDetector: Send + Sync {
    fn is_rate_limited(&self, error: &str) -> bool;
}

/// Interface between the orchestration core and one coding agent.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Stable adapter id, matching the provider id in the registry.
    fn id(&self) -> &str;

    /// Capability surface this adapter offers.
    fn capabilities(&self) -> ProviderCapabilities;

    /// One-time setup with adapter-specific configuration.
    async fn initialize(&self, config: Value) -> Result<()>;

    /// Cheap liveness probe consulted before routing.
    async fn is_available(&self) -> bool;

    /// Execute a task. Returns the event stream for this attempt.
    async fn execute(&self, task: &Task) -> Result<EventStream>;

    /// Best-effort interrupt of the in-flight execution.
    async fn interrupt(&self) -> Result<()>;

    /// Path of the adapter's context file inside the repository, if any.
    fn context_file(&self) -> Option<String> {
        None
    }

    /// Install the project context for subsequent executions.
    async fn set_project_context(&self, context: ProjectContext) -> Result<()>;

    /// Provider-specific rate-limit detector, if the adapter ships one.
    fn rate_limit_detector(&self) -> Option<Arc<dyn RateLimitDetector>> {
        None
    }
}
