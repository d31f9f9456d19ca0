//! Worker registry - membership, heartbeats and staleness sweeps.
//!
//! Mutations are serialized per worker id by the map's entry locks.
//! Workers whose heartbeat ages past the stale threshold are marked
//! offline by `cleanup_stale_workers` (default threshold 300 s).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use agentflow_models::{WorkerInfo, WorkerStatus, now_millis};

use crate::error::{CoreError, Result};

/// Registry of pool workers keyed by worker id.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }

    /// Register a worker, replacing any previous registration.
    pub fn register(&self, worker: WorkerInfo) {
        info!(worker_id = %worker.worker_id, "Worker registered");
        self.workers.insert(worker.worker_id.clone(), worker);
    }

    pub fn unregister(&self, worker_id: &str) -> bool {
        let removed = self.workers.remove(worker_id).is_some();
        if removed {
            info!(worker_id = %worker_id, "Worker unregistered");
        }
        removed
    }

    /// Refresh a worker's heartbeat.
    pub fn update_heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown worker: {worker_id}")))?;
        worker.last_heartbeat = now_millis();
        // A heartbeat from an offline worker brings it back as idle.
        if worker.status == WorkerStatus::Offline {
            worker.status = WorkerStatus::Idle;
        }
        Ok(())
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|w| w.clone())
    }

    /// Workers matching the optional status filter, ordered by id.
    pub fn list_workers(&self, filter: Option<WorkerStatus>) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .filter(|w| filter.is_none_or(|f| w.status == f))
            .map(|w| w.clone())
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn get_idle_workers(&self) -> Vec<WorkerInfo> {
        self.list_workers(Some(WorkerStatus::Idle))
    }

    /// Transition a worker's status, tracking its current task. A busy
    /// worker always has exactly one current task.
    pub fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_task: Option<String>,
    ) -> Result<()> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown worker: {worker_id}")))?;

        if status == WorkerStatus::Busy && current_task.is_none() {
            return Err(CoreError::Validation(
                "busy worker requires a current task".to_string(),
            ));
        }
        worker.status = status;
        worker.current_task = if status == WorkerStatus::Busy {
            current_task
        } else {
            None
        };
        Ok(())
    }

    /// Record one finished task on the worker's counters.
    pub fn record_completion(&self, worker_id: &str, success: bool, busy_ms: u64) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            if success {
                worker.metrics.tasks_completed += 1;
            } else {
                worker.metrics.tasks_failed += 1;
            }
            worker.metrics.total_busy_ms += busy_ms;
        }
    }

    pub fn mark_offline(&self, worker_id: &str) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            warn!(worker_id = %worker_id, "Worker marked offline");
            worker.status = WorkerStatus::Offline;
            worker.current_task = None;
        }
    }

    /// Mark every worker whose heartbeat is older than `timeout_ms`
    /// offline. Returns the affected worker ids.
    pub fn cleanup_stale_workers(&self, timeout_ms: i64) -> Vec<String> {
        let now = now_millis();
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.status != WorkerStatus::Offline && w.is_stale(now, timeout_ms))
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in &stale {
            self.mark_offline(worker_id);
        }
        stale
    }

    /// Spawn a periodic staleness sweep. Abort the returned handle to
    /// stop it.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout_ms: i64,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let stale = registry.cleanup_stale_workers(timeout_ms);
                if !stale.is_empty() {
                    warn!(count = stale.len(), "Stale workers swept offline");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerInfo::new("w1"));

        let worker = registry.get_worker("w1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(registry.get_worker("w2").is_none());
    }

    #[test]
    fn test_heartbeat_revives_offline_worker() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerInfo::new("w1"));
        registry.mark_offline("w1");
        assert_eq!(registry.get_worker("w1").unwrap().status, WorkerStatus::Offline);

        registry.update_heartbeat("w1").unwrap();
        assert_eq!(registry.get_worker("w1").unwrap().status, WorkerStatus::Idle);
    }

    #[test]
    fn test_heartbeat_unknown_worker() {
        let registry = WorkerRegistry::new();
        assert!(registry.update_heartbeat("ghost").is_err());
    }

    #[test]
    fn test_busy_requires_current_task() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerInfo::new("w1"));

        let err = registry.set_status("w1", WorkerStatus::Busy, None).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        registry
            .set_status("w1", WorkerStatus::Busy, Some("t1".to_string()))
            .unwrap();
        let worker = registry.get_worker("w1").unwrap();
        assert_eq!(worker.current_task.as_deref(), Some("t1"));

        registry.set_status("w1", WorkerStatus::Idle, None).unwrap();
        assert!(registry.get_worker("w1").unwrap().current_task.is_none());
    }

    #[test]
    fn test_list_and_filter() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerInfo::new("w1"));
        registry.register(WorkerInfo::new("w2"));
        registry
            .set_status("w2", WorkerStatus::Busy, Some("t1".to_string()))
            .unwrap();

        assert_eq!(registry.list_workers(None).len(), 2);
        assert_eq!(registry.get_idle_workers().len(), 1);
        assert_eq!(registry.get_idle_workers()[0].worker_id, "w1");
    }

    #[test]
    fn test_stale_cleanup() {
        let registry = WorkerRegistry::new();
        let mut fresh = WorkerInfo::new("fresh");
        fresh.last_heartbeat = now_millis();
        let mut stale = WorkerInfo::new("stale");
        stale.last_heartbeat = now_millis() - 600_000;
        registry.register(fresh);
        registry.register(stale);

        let swept = registry.cleanup_stale_workers(300_000);
        assert_eq!(swept, vec!["stale".to_string()]);
        assert_eq!(
            registry.get_worker("stale").unwrap().status,
            WorkerStatus::Offline
        );
        assert_eq!(
            registry.get_worker("fresh").unwrap().status,
            WorkerStatus::Idle
        );
    }

    #[test]
    fn test_completion_counters() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerInfo::new("w1"));

        registry.record_completion("w1", true, 120);
        registry.record_completion("w1", false, 30);

        let metrics = registry.get_worker("w1").unwrap().metrics;
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.total_busy_ms, 150);
    }
}
