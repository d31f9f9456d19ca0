//! Recovery manager - retry, rollback, restore and abort.
//!
//! Keeps an ordered stack of recovery points per task. Strategy selection
//! follows the error taxonomy: retryable kinds retry with backoff, stall
//! markers roll back, corruption markers restore from checkpoint, fatal
//! errors abort.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use agentflow_models::{RecoveryPoint, Task};

use crate::config::RetryConfig;
use crate::error::{CoreError, ErrorKind, Result};
use crate::recovery::checkpoint::CheckpointManager;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    Rollback,
    Restore,
    Abort,
}

/// Result of one recovery execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    pub success: bool,
    /// Recovery points popped by a rollback.
    pub rolled_back: usize,
    /// Attempts consumed by a retry.
    pub retries_attempted: u32,
    /// Task state produced by a restore.
    pub restored_task: Option<Task>,
}

impl RecoveryOutcome {
    fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            success: false,
            rolled_back: 0,
            retries_attempted: 0,
            restored_task: None,
        }
    }
}

/// Retry/rollback/restore coordinator.
pub struct RecoveryManager {
    checkpoints: Arc<CheckpointManager>,
    retry: RetryConfig,
    recovery_points: Mutex<HashMap<String, Vec<RecoveryPoint>>>,
    /// Incremented exactly once per failing operation.
    failed_requests: AtomicU64,
    recoveries_executed: AtomicU64,
}

impl RecoveryManager {
    pub fn new(checkpoints: Arc<CheckpointManager>, retry: RetryConfig) -> Self {
        Self {
            checkpoints,
            retry,
            recovery_points: Mutex::new(HashMap::new()),
            failed_requests: AtomicU64::new(0),
            recoveries_executed: AtomicU64::new(0),
        }
    }

    /// Backoff delay for the given 1-based attempt:
    /// `min(max_delay, initial_delay * multiplier^(n-1))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self
            .retry
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay = (self.retry.initial_delay_ms as f64 * multiplier) as u64;
        Duration::from_millis(delay.min(self.retry.max_delay_ms))
    }

    /// Run `op` with up to `max_attempts` tries. Only retryable error
    /// kinds (network, timeout, rate-limit, temporary) are retried; the
    /// failure counter increments once regardless of how many attempts
    /// the call consumed.
    pub async fn with_retry<T, F, Fut>(&self, ctx: &str, op: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<CoreError> = None;

        for attempt in 1..=self.retry.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable = error.is_retryable();
                    warn!(
                        context = ctx,
                        attempt,
                        retryable,
                        error = %error,
                        "Operation attempt failed"
                    );
                    if !retryable || attempt == self.retry.max_attempts {
                        self.failed_requests.fetch_add(1, Ordering::Relaxed);
                        return Err(error);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    last_error = Some(error);
                }
            }
        }

        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        Err(last_error
            .unwrap_or_else(|| CoreError::Execution(format!("{ctx} failed after retries"))))
    }

    /// Checkpoint the task and push a recovery point onto its stack.
    pub fn create_recovery_point(
        &self,
        task: &Task,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<RecoveryPoint> {
        let checkpoint_id = self.checkpoints.checkpoint(task)?;
        let state = serde_json::to_value(task)?;

        let mut point = RecoveryPoint::new(&task.id, checkpoint_id, state);
        if let Some(metadata) = metadata {
            point.metadata = metadata;
        }

        self.recovery_points
            .lock()
            .entry(task.id.clone())
            .or_default()
            .push(point.clone());
        info!(task_id = %task.id, point_id = %point.id, "Recovery point created");
        Ok(point)
    }

    /// Ordered stack of recovery points for a task, oldest first.
    pub fn get_recovery_points(&self, task_id: &str) -> Vec<RecoveryPoint> {
        self.recovery_points
            .lock()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pop up to `steps` recovery points, never dropping below one
    /// remaining. Returns the rollback outcome; the new top of the stack
    /// is the state rolled back to.
    pub fn rollback(&self, task_id: &str, steps: usize) -> Result<RecoveryOutcome> {
        let mut points = self.recovery_points.lock();
        let stack = points
            .get_mut(task_id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CoreError::Validation(format!("no recovery points for task {task_id}"))
            })?;

        let poppable = stack.len().saturating_sub(1);
        let popped = steps.min(poppable);
        stack.truncate(stack.len() - popped);

        info!(task_id = %task_id, rolled_back = popped, "Rolled back");
        let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Rollback);
        outcome.success = true;
        outcome.rolled_back = popped;
        Ok(outcome)
    }

    /// Restore task state from a checkpoint and push a recovery point
    /// reflecting the restored state.
    pub fn restore(&self, task_id: &str, checkpoint_id: &str) -> Result<Task> {
        let task = self.checkpoints.restore(checkpoint_id)?;
        if task.id != task_id {
            return Err(CoreError::Validation(format!(
                "checkpoint {checkpoint_id} belongs to task {}, not {task_id}",
                task.id
            )));
        }

        let state = serde_json::to_value(&task)?;
        let point = RecoveryPoint::new(task_id, checkpoint_id, state);
        self.recovery_points
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push(point);

        info!(task_id = %task_id, checkpoint_id = %checkpoint_id, "Restored from checkpoint");
        Ok(task)
    }

    /// Map an error and attempt count to a strategy.
    pub fn determine_strategy(&self, error: &CoreError, attempts: u32) -> RecoveryStrategy {
        match error.kind() {
            ErrorKind::Stall => RecoveryStrategy::Rollback,
            ErrorKind::CorruptState => RecoveryStrategy::Restore,
            ErrorKind::Fatal => RecoveryStrategy::Abort,
            kind if kind.is_retryable() && attempts < self.retry.max_attempts => {
                RecoveryStrategy::Retry
            }
            _ => RecoveryStrategy::Abort,
        }
    }

    /// Route a failure to its strategy. A `Retry` strategy re-invokes the
    /// supplied operation through [`Self::with_retry`] rather than
    /// reporting success without re-execution.
    pub async fn execute_recovery<T, F, Fut>(
        &self,
        task_id: &str,
        error: &CoreError,
        attempts: u32,
        op: F,
    ) -> Result<(RecoveryOutcome, Option<T>)>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.recoveries_executed.fetch_add(1, Ordering::Relaxed);
        let strategy = self.determine_strategy(error, attempts);

        match strategy {
            RecoveryStrategy::Retry => {
                let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Retry);
                match self.with_retry(task_id, &op).await {
                    Ok(value) => {
                        outcome.success = true;
                        outcome.retries_attempted = 1;
                        Ok((outcome, Some(value)))
                    }
                    Err(retry_error) => {
                        outcome.retries_attempted = self.retry.max_attempts;
                        Err(retry_error)
                    }
                }
            }
            RecoveryStrategy::Rollback => {
                let outcome = self.rollback(task_id, 1)?;
                Ok((outcome, None))
            }
            RecoveryStrategy::Restore => {
                let latest = self
                    .checkpoints
                    .get_latest_checkpoint(task_id)?
                    .ok_or_else(|| CoreError::CheckpointNotFound(task_id.to_string()))?;
                let task = self.restore(task_id, &latest.id)?;
                let mut outcome = RecoveryOutcome::new(RecoveryStrategy::Restore);
                outcome.success = true;
                outcome.restored_task = Some(task);
                Ok((outcome, None))
            }
            RecoveryStrategy::Abort => {
                let outcome = RecoveryOutcome::new(RecoveryStrategy::Abort);
                Ok((outcome, None))
            }
        }
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn recoveries_executed(&self) -> u64 {
        self.recoveries_executed.load(Ordering::Relaxed)
    }

    /// Drop all recovery points for a task, e.g. on terminal transition.
    pub fn clear_recovery_points(&self, task_id: &str) {
        self.recovery_points.lock().remove(task_id);
    }
}
