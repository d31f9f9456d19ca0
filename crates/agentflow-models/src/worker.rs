//! Worker pool membership and health model.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a pool worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stealing,
    Offline,
}

/// Resources a worker advertises at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerResources {
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub max_concurrent_tasks: u32,
}

/// Rolling execution counters per worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_busy_ms: u64,
}

/// A registered pool worker.
///
/// Heartbeat invariant: a worker with `now - last_heartbeat` beyond the
/// stale threshold must be marked offline by the registry sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub registered_at: i64,
    pub last_heartbeat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: WorkerResources,
    #[serde(default)]
    pub metrics: WorkerMetrics,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let now = crate::now_millis();
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Idle,
            registered_at: now,
            last_heartbeat: now,
            current_task: None,
            capabilities: Vec::new(),
            resources: WorkerResources::default(),
            metrics: WorkerMetrics::default(),
        }
    }

    /// Whether the heartbeat is older than `timeout_ms` relative to `now`.
    pub fn is_stale(&self, now: i64, timeout_ms: i64) -> bool {
        now - self.last_heartbeat > timeout_ms
    }
}
