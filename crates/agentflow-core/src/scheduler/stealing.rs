//! Work-stealing scheduler - deque-based worker load balancing.
//!
//! Each worker owns a double-ended queue. Submissions land at the back of
//! the least-loaded deque; owners consume from the front (FIFO); thieves
//! take from the victim's back (LIFO), preserving locality for the owner
//! and handing bulk work to the thief.

use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use agentflow_models::{TaskNode, WorkerStatus};

use crate::config::{StealPolicy, StealingConfig};

/// Estimated-duration floor above which a stolen task may be split.
const SPLIT_DURATION_THRESHOLD: u64 = 1_000;

/// Scheduler counters and derived gauges.
#[derive(Debug, Clone, PartialEq)]
pub struct StealingMetrics {
    pub completed_tasks: u64,
    pub steal_attempts: u64,
    pub successful_steals: u64,
    pub avg_queue_length: f64,
    /// Fraction of workers currently busy.
    pub worker_utilization: f64,
    /// `1 - (max - min) / max` over queue lengths; 1.0 when max = 0.
    pub load_balance_score: f64,
}

/// Deque-based work-stealing scheduler.
pub struct WorkStealingScheduler {
    config: StealingConfig,
    deques: DashMap<String, VecDeque<TaskNode>>,
    statuses: DashMap<String, WorkerStatus>,
    round_robin: AtomicU64,
    completed_tasks: AtomicU64,
    steal_attempts: AtomicU64,
    successful_steals: AtomicU64,
}

impl WorkStealingScheduler {
    pub fn new(config: StealingConfig) -> Self {
        Self {
            config,
            deques: DashMap::new(),
            statuses: DashMap::new(),
            round_robin: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            steal_attempts: AtomicU64::new(0),
            successful_steals: AtomicU64::new(0),
        }
    }

    /// Register a worker with an empty deque.
    pub fn add_worker(&self, worker_id: impl Into<String>) {
        let id = worker_id.into();
        self.deques.entry(id.clone()).or_default();
        self.statuses.insert(id, WorkerStatus::Idle);
    }

    /// Remove a worker, redistributing any queued tasks.
    pub fn remove_worker(&self, worker_id: &str) {
        let orphaned = self.deques.remove(worker_id).map(|(_, deque)| deque);
        self.statuses.remove(worker_id);

        if let Some(orphaned) = orphaned {
            for task in orphaned {
                self.submit(task);
            }
        }
    }

    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.deques.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn worker_status(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.statuses.get(worker_id).map(|s| *s)
    }

    pub fn queue_length(&self, worker_id: &str) -> usize {
        self.deques.get(worker_id).map(|d| d.len()).unwrap_or(0)
    }

    pub fn total_queued(&self) -> usize {
        self.deques.iter().map(|d| d.len()).sum()
    }

    /// Push a task onto the least-loaded worker's deque.
    pub fn submit(&self, task: TaskNode) {
        let target = self
            .deques
            .iter()
            .min_by_key(|entry| entry.value().len())
            .map(|entry| entry.key().clone());

        match target {
            Some(worker_id) => {
                trace!(worker_id = %worker_id, task_id = %task.id, "Queueing task");
                if let Some(mut deque) = self.deques.get_mut(&worker_id) {
                    deque.push_back(task);
                }
            }
            None => {
                debug!(task_id = %task.id, "No workers registered; dropping submit");
            }
        }
    }

    /// Bulk submission distributes round-robin across workers.
    pub fn submit_bulk(&self, tasks: Vec<TaskNode>) {
        let workers = self.worker_ids();
        if workers.is_empty() {
            return;
        }
        for task in tasks {
            let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % workers.len();
            if let Some(mut deque) = self.deques.get_mut(&workers[idx]) {
                deque.push_back(task);
            }
        }
    }

    /// Next task for a worker: FIFO from its own deque, else steal.
    ///
    /// Stealing transitions the worker to `Stealing`, tries up to
    /// `max_steal_attempts` victims with backoff between failures, and
    /// returns the worker to `Idle` when giving up.
    pub async fn get_next_task(&self, worker_id: &str) -> Option<TaskNode> {
        if let Some(mut deque) = self.deques.get_mut(worker_id)
            && let Some(task) = deque.pop_front()
        {
            drop(deque);
            self.statuses.insert(worker_id.to_string(), WorkerStatus::Busy);
            return Some(task);
        }

        self.statuses
            .insert(worker_id.to_string(), WorkerStatus::Stealing);

        for attempt in 0..self.config.max_steal_attempts {
            self.steal_attempts.fetch_add(1, Ordering::Relaxed);

            if let Some(task) = self.try_steal(worker_id) {
                self.successful_steals.fetch_add(1, Ordering::Relaxed);
                self.statuses.insert(worker_id.to_string(), WorkerStatus::Busy);
                debug!(thief = %worker_id, task_id = %task.id, "Steal succeeded");
                return Some(task);
            }

            if attempt + 1 < self.config.max_steal_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.backoff_delay_ms)).await;
            }
        }

        self.statuses.insert(worker_id.to_string(), WorkerStatus::Idle);
        None
    }

    fn try_steal(&self, thief: &str) -> Option<TaskNode> {
        // Candidate victims: everyone else with a queue worth raiding.
        let mut candidates: Vec<(String, usize)> = self
            .deques
            .iter()
            .filter(|entry| entry.key() != thief)
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .filter(|(_, len)| *len >= self.config.min_queue_size_for_steal)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let victim = match self.config.policy {
            StealPolicy::Random => {
                let idx = rand::rng().random_range(0..candidates.len());
                candidates[idx].0.clone()
            }
            StealPolicy::MostLoaded => {
                candidates
                    .iter()
                    .max_by_key(|(_, len)| *len)?
                    .0
                    .clone()
            }
        };

        let mut deque = self.deques.get_mut(&victim)?;
        // Re-check under the lock; the victim may have drained meanwhile.
        if deque.len() < self.config.min_queue_size_for_steal {
            return None;
        }
        let mut stolen = deque.pop_back()?;

        if self.config.enable_splitting
            && stolen.splittable
            && stolen.estimated_duration > SPLIT_DURATION_THRESHOLD
        {
            // The victim keeps the deferred half at half the estimate.
            let mut remainder = stolen.clone();
            remainder.id = format!("{}:split", stolen.id);
            remainder.estimated_duration = stolen.estimated_duration / 2;
            stolen.estimated_duration -= remainder.estimated_duration;
            deque.push_back(remainder);
        }

        Some(stolen)
    }

    /// Record task completion and return the worker to idle.
    pub fn complete_task(&self, worker_id: &str) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        self.statuses.insert(worker_id.to_string(), WorkerStatus::Idle);
    }

    pub fn metrics(&self) -> StealingMetrics {
        let lengths: Vec<usize> = self.deques.iter().map(|d| d.len()).collect();
        let worker_count = lengths.len();

        let avg_queue_length = if worker_count == 0 {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / worker_count as f64
        };

        let busy = self
            .statuses
            .iter()
            .filter(|s| *s.value() == WorkerStatus::Busy)
            .count();
        let worker_utilization = if worker_count == 0 {
            0.0
        } else {
            busy as f64 / worker_count as f64
        };

        let max = lengths.iter().copied().max().unwrap_or(0);
        let min = lengths.iter().copied().min().unwrap_or(0);
        let load_balance_score = if max == 0 {
            1.0
        } else {
            1.0 - (max - min) as f64 / max as f64
        };

        StealingMetrics {
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            steal_attempts: self.steal_attempts.load(Ordering::Relaxed),
            successful_steals: self.successful_steals.load(Ordering::Relaxed),
            avg_queue_length,
            worker_utilization,
            load_balance_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(policy: StealPolicy) -> WorkStealingScheduler {
        WorkStealingScheduler::new(StealingConfig {
            policy,
            min_queue_size_for_steal: 2,
            max_steal_attempts: 3,
            backoff_delay_ms: 1,
            enable_splitting: false,
        })
    }

    fn task(id: &str, duration: u64) -> TaskNode {
        TaskNode::new(id, "codegen").with_duration(duration)
    }

    #[tokio::test]
    async fn test_own_queue_fifo() {
        let sched = scheduler(StealPolicy::MostLoaded);
        sched.add_worker("w1");

        sched.submit(task("a", 10));
        sched.submit(task("b", 10));

        let first = sched.get_next_task("w1").await.unwrap();
        let second = sched.get_next_task("w1").await.unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(second.id, "b");
    }

    #[tokio::test]
    async fn test_submit_targets_least_loaded() {
        let sched = scheduler(StealPolicy::MostLoaded);
        sched.add_worker("w1");
        sched.add_worker("w2");

        sched.submit(task("a", 10));
        sched.submit(task("b", 10));

        assert_eq!(sched.queue_length("w1"), 1);
        assert_eq!(sched.queue_length("w2"), 1);
    }

    #[tokio::test]
    async fn test_bulk_round_robin_balances() {
        let sched = scheduler(StealPolicy::MostLoaded);
        sched.add_worker("w1");
        sched.add_worker("w2");

        sched.submit_bulk((0..6).map(|i| task(&format!("t{i}"), 10)).collect());

        assert_eq!(sched.queue_length("w1"), 3);
        assert_eq!(sched.queue_length("w2"), 3);
        let metrics = sched.metrics();
        assert!((metrics.load_balance_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_steal_from_back_of_most_loaded() {
        let sched = scheduler(StealPolicy::MostLoaded);
        sched.add_worker("busy");
        sched.add_worker("starved");

        // Load everything onto one worker.
        for i in 0..4 {
            if let Some(mut deque) = sched.deques.get_mut("busy") {
                deque.push_back(task(&format!("t{i}"), 10));
            }
        }

        let stolen = sched.get_next_task("starved").await.unwrap();
        // LIFO from the victim's back.
        assert_eq!(stolen.id, "t3");
        assert_eq!(sched.queue_length("busy"), 3);
        assert_eq!(sched.metrics().successful_steals, 1);
        assert_eq!(sched.worker_status("starved"), Some(WorkerStatus::Busy));
    }

    #[tokio::test]
    async fn test_steal_respects_min_queue_size() {
        let sched = scheduler(StealPolicy::Random);
        sched.add_worker("w1");
        sched.add_worker("w2");

        if let Some(mut deque) = sched.deques.get_mut("w1") {
            deque.push_back(task("only", 10));
        }

        // w1 holds a single task, below min_queue_size_for_steal.
        let got = sched.get_next_task("w2").await;
        assert!(got.is_none());
        assert_eq!(sched.queue_length("w1"), 1);
        // Worker returned to idle after exhausting its attempts.
        assert_eq!(sched.worker_status("w2"), Some(WorkerStatus::Idle));
        assert_eq!(sched.metrics().steal_attempts, 3);
    }

    #[tokio::test]
    async fn test_splitting_returns_half_to_victim() {
        let sched = WorkStealingScheduler::new(StealingConfig {
            policy: StealPolicy::MostLoaded,
            min_queue_size_for_steal: 1,
            max_steal_attempts: 1,
            backoff_delay_ms: 1,
            enable_splitting: true,
        });
        sched.add_worker("victim");
        sched.add_worker("thief");

        if let Some(mut deque) = sched.deques.get_mut("victim") {
            deque.push_back(task("big", 4_000).splittable());
        }

        let stolen = sched.get_next_task("thief").await.unwrap();
        assert_eq!(stolen.id, "big");
        assert_eq!(stolen.estimated_duration, 2_000);

        assert_eq!(sched.queue_length("victim"), 1);
        let remainder = sched.get_next_task("victim").await.unwrap();
        assert_eq!(remainder.id, "big:split");
        assert_eq!(remainder.estimated_duration, 2_000);
    }

    #[tokio::test]
    async fn test_quiescence_drains_all_inputs() {
        let sched = scheduler(StealPolicy::MostLoaded);
        for id in ["w1", "w2", "w3"] {
            sched.add_worker(id);
        }
        sched.submit_bulk((0..9).map(|i| task(&format!("t{i}"), 10)).collect());

        let mut drained = 0;
        for worker in ["w1", "w2", "w3"] {
            while sched.get_next_task(worker).await.is_some() {
                sched.complete_task(worker);
                drained += 1;
            }
        }
        assert_eq!(drained, 9);
        assert_eq!(sched.total_queued(), 0);
        assert_eq!(sched.metrics().completed_tasks, 9);
        assert!((sched.metrics().load_balance_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_remove_worker_redistributes() {
        let sched = scheduler(StealPolicy::MostLoaded);
        sched.add_worker("w1");
        sched.add_worker("w2");

        if let Some(mut deque) = sched.deques.get_mut("w1") {
            deque.push_back(task("a", 10));
            deque.push_back(task("b", 10));
        }

        sched.remove_worker("w1");
        assert_eq!(sched.queue_length("w2"), 2);
    }
}
