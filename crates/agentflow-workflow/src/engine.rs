//! The workflow engine: durable step execution with retries, checkpoints,
//! signals, HITL approval and replay.
//!
//! Each execution is driven by a spawned task. Steps run in order; after
//! every successful step the engine advances `current_step_index`, records
//! the step output in the execution state and, depending on the
//! checkpoint strategy, persists a checkpoint the execution can replay
//! from.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentflow_models::now_millis;

use crate::error::{Result, WorkflowError};
use crate::model::{
    ActivityHandler, ApprovalDecision, CheckpointStrategy, RetryPolicy, StepType,
    WorkflowCheckpoint, WorkflowDefinition, WorkflowEvent, WorkflowEventKind, WorkflowExecution,
    WorkflowStatus, WorkflowStep,
};
use crate::store::WorkflowCheckpointStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct RegisteredActivity {
    handler: ActivityHandler,
    retry_policy: Option<RetryPolicy>,
}

struct PendingApproval {
    workflow_id: String,
    step_id: String,
    decision: oneshot::Sender<ApprovalDecision>,
}

#[derive(Default)]
struct EngineMetrics {
    workflows_started: AtomicU64,
    workflows_completed: AtomicU64,
    activities_executed: AtomicU64,
    activities_retried: AtomicU64,
    checkpoints_created: AtomicU64,
    total_workflow_duration_ms: AtomicU64,
}

/// Monotonic engine counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkflowMetricsSnapshot {
    pub workflows_started: u64,
    pub workflows_completed: u64,
    pub activities_executed: u64,
    pub activities_retried: u64,
    pub checkpoints_created: u64,
    pub avg_workflow_duration_ms: f64,
}

/// Durable step-structured workflow executor.
pub struct WorkflowEngine {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    activities: RwLock<HashMap<String, RegisteredActivity>>,
    executions: DashMap<String, WorkflowExecution>,
    checkpoints: Arc<dyn WorkflowCheckpointStore>,
    /// Pending signals per workflow: (name, payload).
    signals: Mutex<HashMap<String, VecDeque<(String, Option<Value>)>>>,
    approvals: Mutex<HashMap<String, PendingApproval>>,
    cancels: DashMap<String, watch::Sender<bool>>,
    events: broadcast::Sender<WorkflowEvent>,
    metrics: EngineMetrics,
}

impl WorkflowEngine {
    pub fn new(checkpoints: Arc<dyn WorkflowCheckpointStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            definitions: RwLock::new(HashMap::new()),
            activities: RwLock::new(HashMap::new()),
            executions: DashMap::new(),
            checkpoints,
            signals: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            cancels: DashMap::new(),
            events,
            metrics: EngineMetrics::default(),
        })
    }

    pub fn register_workflow(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .insert(definition.name.clone(), definition);
    }

    pub fn register_activity(
        &self,
        name: impl Into<String>,
        handler: ActivityHandler,
        retry_policy: Option<RetryPolicy>,
    ) {
        self.activities.write().insert(
            name.into(),
            RegisteredActivity {
                handler,
                retry_policy,
            },
        );
    }

    /// Subscribe to the engine's event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Start a run of a registered workflow and return its handle state.
    pub fn start_workflow(
        self: &Arc<Self>,
        name: &str,
        input: Option<Value>,
    ) -> Result<WorkflowExecution> {
        let execution = self.create_execution(name, input)?;
        let snapshot = execution.clone();
        let engine = Arc::clone(self);
        let workflow_id = execution.workflow_id.clone();
        tokio::spawn(async move {
            engine.drive(workflow_id).await;
        });
        Ok(snapshot)
    }

    fn create_execution(
        self: &Arc<Self>,
        name: &str,
        input: Option<Value>,
    ) -> Result<WorkflowExecution> {
        if !self.definitions.read().contains_key(name) {
            return Err(WorkflowError::DefinitionNotFound(name.to_string()));
        }

        let execution = WorkflowExecution::new(name, input.unwrap_or(Value::Null));
        let (cancel, _) = watch::channel(false);
        self.cancels.insert(execution.workflow_id.clone(), cancel);
        self.executions
            .insert(execution.workflow_id.clone(), execution.clone());
        self.metrics.workflows_started.fetch_add(1, Ordering::Relaxed);
        info!(workflow_id = %execution.workflow_id, name = %name, "Workflow started");
        Ok(execution)
    }

    /// Step loop for one execution. Boxed for child-workflow recursion.
    fn drive(self: Arc<Self>, workflow_id: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            loop {
                let Some(execution) = self.executions.get(&workflow_id).map(|e| e.clone()) else {
                    error!(workflow_id = %workflow_id, "Execution disappeared");
                    return;
                };
                if execution.status.is_terminal() {
                    return;
                }

                let Some(definition) = self
                    .definitions
                    .read()
                    .get(&execution.name)
                    .cloned()
                else {
                    self.fail_workflow(&workflow_id, "definition vanished").await;
                    return;
                };

                let index = execution.current_step_index;
                if index >= definition.steps.len() {
                    self.complete_workflow(&workflow_id, &execution);
                    return;
                }
                let step = definition.steps[index].clone();

                self.emit(
                    &workflow_id,
                    WorkflowEventKind::StepStarted {
                        step_id: step.id.clone(),
                    },
                );

                // HITL gate before the step body.
                if step.requires_human_approval && definition.enable_hitl {
                    match self.await_approval(&workflow_id, &step).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.fail_workflow(
                                &workflow_id,
                                &WorkflowError::ApprovalRejected(step.id.clone()).to_string(),
                            )
                            .await;
                            return;
                        }
                        Err(error) => {
                            self.fail_workflow(&workflow_id, &error.to_string()).await;
                            return;
                        }
                    }
                }

                match self.run_step(&workflow_id, &definition, &step, &execution).await {
                    Ok(output) => {
                        let advanced = {
                            let Some(mut entry) = self.executions.get_mut(&workflow_id) else {
                                return;
                            };
                            if entry.status == WorkflowStatus::Cancelled {
                                return;
                            }
                            if let Some(output) = output
                                && let Some(map) = entry.state.as_object_mut()
                            {
                                map.insert(step.id.clone(), output);
                            }
                            entry.current_step_index = index + 1;
                            entry.status = WorkflowStatus::Running;
                            entry.clone()
                        };

                        let should_checkpoint = match definition.checkpoint_strategy {
                            CheckpointStrategy::EveryStep => true,
                            CheckpointStrategy::Manual => step.requires_checkpoint,
                            CheckpointStrategy::None => false,
                        };
                        if should_checkpoint {
                            self.write_checkpoint(&advanced);
                        }

                        self.emit(
                            &workflow_id,
                            WorkflowEventKind::StepCompleted {
                                step_id: step.id.clone(),
                            },
                        );
                    }
                    Err(WorkflowError::Cancelled) => {
                        debug!(workflow_id = %workflow_id, "Step observed cancellation");
                        return;
                    }
                    Err(error) => {
                        self.emit(
                            &workflow_id,
                            WorkflowEventKind::StepFailed {
                                step_id: step.id.clone(),
                                message: error.to_string(),
                            },
                        );
                        self.fail_workflow(&workflow_id, &error.to_string()).await;
                        return;
                    }
                }
            }
        })
    }

    async fn run_step(
        self: &Arc<Self>,
        workflow_id: &str,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
    ) -> Result<Option<Value>> {
        match step.step_type {
            StepType::Activity => {
                let activity_name = step
                    .activity_name
                    .as_deref()
                    .ok_or(WorkflowError::ActivityNameRequired)?;
                self.run_activity(workflow_id, definition, step, activity_name, execution)
                    .await
                    .map(Some)
            }
            StepType::Timer => {
                let duration = Duration::from_millis(step.timeout_ms.unwrap_or(0));
                self.cancellable_sleep(workflow_id, duration).await?;
                Ok(None)
            }
            StepType::Signal => {
                let name = step
                    .signal_name
                    .clone()
                    .unwrap_or_else(|| step.id.clone());
                self.emit(workflow_id, WorkflowEventKind::SignalEmitted { name: name.clone() });

                // Consume a queued signal of the same name, if any.
                let payload = {
                    let mut signals = self.signals.lock();
                    signals.get_mut(workflow_id).and_then(|queue| {
                        let position = queue.iter().position(|(n, _)| n == &name)?;
                        queue.remove(position).and_then(|(_, payload)| payload)
                    })
                };
                Ok(payload)
            }
            StepType::Decision => {
                // Branch evaluation lives in activity results; the step
                // itself completes immediately.
                Ok(None)
            }
            StepType::ChildWorkflow => {
                let child_name = step.child_workflow.as_deref().ok_or_else(|| {
                    WorkflowError::InvalidState(format!(
                        "child-workflow step {} has no workflow name",
                        step.id
                    ))
                })?;

                let child = self.create_execution(child_name, Some(execution.state.clone()))?;
                let child_id = child.workflow_id.clone();
                Arc::clone(self).drive(child_id.clone()).await;

                let finished = self
                    .executions
                    .get(&child_id)
                    .map(|e| e.clone())
                    .ok_or_else(|| WorkflowError::WorkflowNotFound(child_id.clone()))?;
                match finished.status {
                    WorkflowStatus::Completed => Ok(Some(finished.state)),
                    status => Err(WorkflowError::StepFailed {
                        step_id: step.id.clone(),
                        message: format!(
                            "child workflow {child_id} ended {status:?}: {}",
                            finished.error.unwrap_or_default()
                        ),
                    }),
                }
            }
        }
    }

    async fn run_activity(
        self: &Arc<Self>,
        workflow_id: &str,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        activity_name: &str,
        execution: &WorkflowExecution,
    ) -> Result<Value> {
        let (handler, activity_policy) = {
            let activities = self.activities.read();
            let activity = activities
                .get(activity_name)
                .ok_or_else(|| WorkflowError::ActivityNotFound(activity_name.to_string()))?;
            (activity.handler.clone(), activity.retry_policy.clone())
        };

        // Step policy overrides the activity's, which overrides the
        // workflow default.
        let policy = step
            .retry_policy
            .clone()
            .or(activity_policy)
            .unwrap_or_else(|| definition.retry_policy.clone());

        let input = json!({
            "input": execution.input,
            "state": execution.state,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.metrics.activities_executed.fetch_add(1, Ordering::Relaxed);

            let invocation = (handler)(input.clone());
            let result = match step.timeout_ms {
                Some(ms) if step.step_type == StepType::Activity => {
                    match tokio::time::timeout(Duration::from_millis(ms), invocation).await {
                        Ok(result) => result,
                        Err(_) => Err(WorkflowError::Activity(format!(
                            "activity {activity_name} timed out after {ms}ms"
                        ))),
                    }
                }
                _ => invocation.await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let message = error.to_string();
                    let non_retryable = policy.is_non_retryable(&message);
                    if non_retryable || attempt >= policy.maximum_attempts {
                        return Err(WorkflowError::StepFailed {
                            step_id: step.id.clone(),
                            message,
                        });
                    }
                    self.metrics.activities_retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        workflow_id = %workflow_id,
                        activity = %activity_name,
                        attempt,
                        error = %message,
                        "Activity failed; retrying"
                    );
                    self.cancellable_sleep(
                        workflow_id,
                        Duration::from_millis(policy.delay_ms(attempt)),
                    )
                    .await?;
                }
            }
        }
    }

    /// Sleep that aborts with `Cancelled` when the workflow is cancelled.
    async fn cancellable_sleep(&self, workflow_id: &str, duration: Duration) -> Result<()> {
        let mut cancel_rx = match self.cancels.get(workflow_id) {
            Some(entry) => entry.subscribe(),
            None => {
                tokio::time::sleep(duration).await;
                return Ok(());
            }
        };
        if *cancel_rx.borrow() {
            return Err(WorkflowError::Cancelled);
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            changed = cancel_rx.changed() => {
                if changed.is_ok() && *cancel_rx.borrow() {
                    Err(WorkflowError::Cancelled)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Pause for human approval; resolves to approve/reject.
    async fn await_approval(&self, workflow_id: &str, step: &WorkflowStep) -> Result<bool> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.approvals.lock().insert(
            request_id.clone(),
            PendingApproval {
                workflow_id: workflow_id.to_string(),
                step_id: step.id.clone(),
                decision: tx,
            },
        );
        if let Some(mut entry) = self.executions.get_mut(workflow_id) {
            entry.status = WorkflowStatus::WaitingApproval;
        }
        self.emit(
            workflow_id,
            WorkflowEventKind::ApprovalRequested {
                request_id: request_id.clone(),
                step_id: step.id.clone(),
            },
        );

        let decision = match step.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), rx).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(_)) => return Err(WorkflowError::ApprovalNotFound(request_id)),
                Err(_) => {
                    self.approvals.lock().remove(&request_id);
                    return Err(WorkflowError::StepFailed {
                        step_id: step.id.clone(),
                        message: format!("approval timed out after {ms}ms"),
                    });
                }
            },
            None => rx
                .await
                .map_err(|_| WorkflowError::ApprovalNotFound(request_id.clone()))?,
        };

        if let Some(mut entry) = self.executions.get_mut(workflow_id) {
            if entry.status == WorkflowStatus::WaitingApproval {
                entry.status = WorkflowStatus::Running;
            }
        }
        Ok(decision.approved)
    }

    /// Resolve a pending approval request.
    pub fn submit_decision(&self, request_id: &str, decision: ApprovalDecision) -> Result<()> {
        let pending = self
            .approvals
            .lock()
            .remove(request_id)
            .ok_or_else(|| WorkflowError::ApprovalNotFound(request_id.to_string()))?;

        self.emit(
            &pending.workflow_id,
            WorkflowEventKind::ApprovalSubmitted {
                request_id: request_id.to_string(),
                approved: decision.approved,
            },
        );
        debug!(
            workflow_id = %pending.workflow_id,
            step_id = %pending.step_id,
            approved = decision.approved,
            "Approval decision submitted"
        );
        let _ = pending.decision.send(decision);
        Ok(())
    }

    /// Enqueue a named signal; a future signal step consumes it.
    pub fn send_signal(&self, workflow_id: &str, name: &str, data: Option<Value>) -> Result<()> {
        if !self.executions.contains_key(workflow_id) {
            return Err(WorkflowError::WorkflowNotFound(workflow_id.to_string()));
        }
        self.signals
            .lock()
            .entry(workflow_id.to_string())
            .or_default()
            .push_back((name.to_string(), data));
        self.emit(
            workflow_id,
            WorkflowEventKind::SignalReceived {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn query_workflow(&self, workflow_id: &str) -> Result<WorkflowExecution> {
        self.executions
            .get(workflow_id)
            .map(|e| e.clone())
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Cancel a running workflow; in-flight steps see the cancellation at
    /// their next suspension point.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut entry = self
            .executions
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        if entry.status.is_terminal() {
            return Err(WorkflowError::InvalidState(format!(
                "workflow {workflow_id} already {:?}",
                entry.status
            )));
        }
        entry.status = WorkflowStatus::Cancelled;
        entry.completed_at = Some(now_millis());
        drop(entry);

        if let Some(cancel) = self.cancels.get(workflow_id) {
            let _ = cancel.send(true);
        }
        self.emit(workflow_id, WorkflowEventKind::Cancelled);
        info!(workflow_id = %workflow_id, "Workflow cancelled");
        Ok(())
    }

    /// Checkpoints for one workflow, newest first.
    pub fn get_workflow_history(&self, workflow_id: &str) -> Result<Vec<WorkflowCheckpoint>> {
        self.checkpoints.list(workflow_id)
    }

    /// Rewind an execution to a checkpoint and resume from its step.
    pub fn replay_from_checkpoint(
        self: &Arc<Self>,
        workflow_id: &str,
        checkpoint_id: &str,
    ) -> Result<WorkflowExecution> {
        let checkpoint = self
            .checkpoints
            .load(checkpoint_id)?
            .ok_or_else(|| WorkflowError::CheckpointNotFound(checkpoint_id.to_string()))?;
        if checkpoint.workflow_id != workflow_id {
            return Err(WorkflowError::InvalidState(format!(
                "checkpoint {checkpoint_id} belongs to workflow {}",
                checkpoint.workflow_id
            )));
        }

        let snapshot = {
            let mut entry = self
                .executions
                .get_mut(workflow_id)
                .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
            entry.current_step_index = checkpoint.step_index;
            entry.state = checkpoint.state.clone();
            entry.status = WorkflowStatus::Running;
            entry.error = None;
            entry.completed_at = None;
            entry.clone()
        };

        // Fresh cancellation scope for the replayed run.
        let (cancel, _) = watch::channel(false);
        self.cancels.insert(workflow_id.to_string(), cancel);

        info!(
            workflow_id = %workflow_id,
            checkpoint_id = %checkpoint_id,
            step_index = checkpoint.step_index,
            "Replaying from checkpoint"
        );
        let engine = Arc::clone(self);
        let id = workflow_id.to_string();
        tokio::spawn(async move {
            engine.drive(id).await;
        });
        Ok(snapshot)
    }

    pub fn metrics(&self) -> WorkflowMetricsSnapshot {
        let completed = self.metrics.workflows_completed.load(Ordering::Relaxed);
        let total_ms = self
            .metrics
            .total_workflow_duration_ms
            .load(Ordering::Relaxed);
        WorkflowMetricsSnapshot {
            workflows_started: self.metrics.workflows_started.load(Ordering::Relaxed),
            workflows_completed: completed,
            activities_executed: self.metrics.activities_executed.load(Ordering::Relaxed),
            activities_retried: self.metrics.activities_retried.load(Ordering::Relaxed),
            checkpoints_created: self.metrics.checkpoints_created.load(Ordering::Relaxed),
            avg_workflow_duration_ms: if completed == 0 {
                0.0
            } else {
                total_ms as f64 / completed as f64
            },
        }
    }

    fn write_checkpoint(&self, execution: &WorkflowExecution) {
        let checkpoint = WorkflowCheckpoint {
            id: Uuid::new_v4().to_string(),
            workflow_id: execution.workflow_id.clone(),
            step_index: execution.current_step_index,
            created_at: now_millis(),
            state: execution.state.clone(),
        };
        match self.checkpoints.save(&checkpoint) {
            Ok(()) => {
                self.metrics.checkpoints_created.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(
                    workflow_id = %execution.workflow_id,
                    error = %error,
                    "Checkpoint write failed"
                );
            }
        }
    }

    fn complete_workflow(&self, workflow_id: &str, execution: &WorkflowExecution) {
        if let Some(mut entry) = self.executions.get_mut(workflow_id) {
            entry.status = WorkflowStatus::Completed;
            entry.completed_at = Some(now_millis());
        }
        self.metrics.workflows_completed.fetch_add(1, Ordering::Relaxed);
        let duration = (now_millis() - execution.started_at).max(0) as u64;
        self.metrics
            .total_workflow_duration_ms
            .fetch_add(duration, Ordering::Relaxed);
        self.emit(workflow_id, WorkflowEventKind::Completed);
        info!(workflow_id = %workflow_id, "Workflow completed");
    }

    async fn fail_workflow(&self, workflow_id: &str, message: &str) {
        if let Some(mut entry) = self.executions.get_mut(workflow_id) {
            // A cancellation that raced the failure wins.
            if entry.status.is_terminal() {
                return;
            }
            entry.status = WorkflowStatus::Failed;
            entry.error = Some(message.to_string());
            entry.completed_at = Some(now_millis());
        }
        self.emit(
            workflow_id,
            WorkflowEventKind::Failed {
                message: message.to_string(),
            },
        );
        error!(workflow_id = %workflow_id, error = %message, "Workflow failed");
    }

    fn emit(&self, workflow_id: &str, kind: WorkflowEventKind) {
        let _ = self.events.send(WorkflowEvent {
            workflow_id: workflow_id.to_string(),
            timestamp: now_millis(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryWorkflowCheckpoints;
    use std::sync::atomic::AtomicU32;

    fn engine() -> Arc<WorkflowEngine> {
        WorkflowEngine::new(Arc::new(InMemoryWorkflowCheckpoints::new()))
    }

    fn echo_activity(tag: &str) -> ActivityHandler {
        let tag = tag.to_string();
        Arc::new(move |_input| {
            let tag = tag.clone();
            Box::pin(async move { Ok(json!({ "ran": tag })) })
        })
    }

    async fn wait_terminal(engine: &Arc<WorkflowEngine>, workflow_id: &str) -> WorkflowExecution {
        for _ in 0..500 {
            let execution = engine.query_workflow(workflow_id).unwrap();
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("workflow {workflow_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_sequential_activities_complete() {
        let engine = engine();
        engine.register_activity("build", echo_activity("build"), None);
        engine.register_activity("test", echo_activity("test"), None);
        engine.register_workflow(WorkflowDefinition::new(
            "ship",
            vec![
                WorkflowStep::activity("s1", "build"),
                WorkflowStep::activity("s2", "test"),
            ],
        ));

        let execution = engine.start_workflow("ship", Some(json!({"ref": "main"}))).unwrap();
        assert_eq!(execution.status, WorkflowStatus::Running);
        assert_eq!(execution.current_step_index, 0);

        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.current_step_index, 2);
        assert_eq!(finished.state["s1"]["ran"], "build");
        assert_eq!(finished.state["s2"]["ran"], "test");

        let metrics = engine.metrics();
        assert_eq!(metrics.workflows_started, 1);
        assert_eq!(metrics.workflows_completed, 1);
        assert_eq!(metrics.activities_executed, 2);
    }

    #[tokio::test]
    async fn test_unknown_definition_rejected() {
        let engine = engine();
        let err = engine.start_workflow("ghost", None).unwrap_err();
        assert!(matches!(err, WorkflowError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn test_activity_name_required() {
        let engine = engine();
        let mut step = WorkflowStep::activity("s1", "x");
        step.activity_name = None;
        engine.register_workflow(WorkflowDefinition::new("bad", vec![step]));

        let execution = engine.start_workflow("bad", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Failed);
        assert!(finished.error.unwrap().contains("Activity name required"));
    }

    #[tokio::test]
    async fn test_missing_activity_fails() {
        let engine = engine();
        engine.register_workflow(WorkflowDefinition::new(
            "bad",
            vec![WorkflowStep::activity("s1", "nonexistent")],
        ));

        let execution = engine.start_workflow("bad", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Failed);
        assert!(finished.error.unwrap().contains("Activity not found"));
    }

    #[tokio::test]
    async fn test_activity_retries_until_success() {
        let engine = engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        engine.register_activity(
            "flaky",
            Arc::new(move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(WorkflowError::Activity("transient".to_string()))
                    } else {
                        Ok(json!("ok"))
                    }
                })
            }),
            None,
        );
        engine.register_workflow(
            WorkflowDefinition::new("retry", vec![WorkflowStep::activity("s1", "flaky")])
                .with_retry(RetryPolicy {
                    initial_interval_ms: 1,
                    backoff_coefficient: 2.0,
                    maximum_interval_ms: 5,
                    maximum_attempts: 5,
                    non_retryable_errors: vec![],
                }),
        );

        let execution = engine.start_workflow("retry", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(engine.metrics().activities_retried, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let engine = engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        engine.register_activity(
            "strict",
            Arc::new(move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(WorkflowError::Activity("InvalidInput: nope".to_string()))
                })
            }),
            None,
        );
        engine.register_workflow(
            WorkflowDefinition::new("strict", vec![WorkflowStep::activity("s1", "strict")])
                .with_retry(RetryPolicy {
                    initial_interval_ms: 1,
                    maximum_attempts: 5,
                    non_retryable_errors: vec!["InvalidInput".to_string()],
                    ..Default::default()
                }),
        );

        let execution = engine.start_workflow("strict", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timer_and_decision_steps() {
        let engine = engine();
        engine.register_workflow(WorkflowDefinition::new(
            "timed",
            vec![
                WorkflowStep::timer("pause", 10),
                WorkflowStep::decision("branch"),
            ],
        ));

        let execution = engine.start_workflow("timed", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert!(finished.completed_at.unwrap() - finished.started_at >= 10);
    }

    #[tokio::test]
    async fn test_signal_step_consumes_pending_signal() {
        let engine = engine();
        engine.register_workflow(WorkflowDefinition::new(
            "signalled",
            vec![
                WorkflowStep::timer("wait", 20),
                WorkflowStep::signal("go", "green-light"),
            ],
        ));
        let mut events = engine.subscribe();

        let execution = engine.start_workflow("signalled", None).unwrap();
        engine
            .send_signal(&execution.workflow_id, "green-light", Some(json!({"lane": 3})))
            .unwrap();

        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.state["go"]["lane"], 3);

        let mut saw_emitted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event.kind, WorkflowEventKind::SignalEmitted { ref name } if name == "green-light")
            {
                saw_emitted = true;
            }
        }
        assert!(saw_emitted);
    }

    #[tokio::test]
    async fn test_send_signal_to_missing_workflow_fails() {
        let engine = engine();
        let err = engine.send_signal("ghost", "x", None).unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_child_workflow_runs_to_completion() {
        let engine = engine();
        engine.register_activity("inner", echo_activity("inner"), None);
        engine.register_workflow(WorkflowDefinition::new(
            "child",
            vec![WorkflowStep::activity("c1", "inner")],
        ));
        engine.register_workflow(WorkflowDefinition::new(
            "parent",
            vec![WorkflowStep::child("spawn", "child")],
        ));

        let execution = engine.start_workflow("parent", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(finished.state["spawn"]["c1"]["ran"], "inner");
        assert_eq!(engine.metrics().workflows_started, 2);
    }

    #[tokio::test]
    async fn test_child_workflow_failure_propagates() {
        let engine = engine();
        engine.register_workflow(WorkflowDefinition::new(
            "child",
            vec![WorkflowStep::activity("c1", "missing-activity")],
        ));
        engine.register_workflow(WorkflowDefinition::new(
            "parent",
            vec![WorkflowStep::child("spawn", "child")],
        ));

        let execution = engine.start_workflow("parent", None).unwrap();
        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkpoints_every_step() {
        let engine = engine();
        engine.register_activity("a", echo_activity("a"), None);
        engine.register_workflow(WorkflowDefinition::new(
            "chk",
            vec![
                WorkflowStep::activity("s1", "a"),
                WorkflowStep::activity("s2", "a"),
            ],
        ));

        let execution = engine.start_workflow("chk", None).unwrap();
        wait_terminal(&engine, &execution.workflow_id).await;

        let history = engine.get_workflow_history(&execution.workflow_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(engine.metrics().checkpoints_created, 2);
    }

    #[tokio::test]
    async fn test_manual_checkpoint_strategy() {
        let engine = engine();
        engine.register_activity("a", echo_activity("a"), None);
        engine.register_workflow(
            WorkflowDefinition::new(
                "chk",
                vec![
                    WorkflowStep::activity("s1", "a"),
                    WorkflowStep::activity("s2", "a").with_checkpoint(),
                ],
            )
            .with_checkpoint_strategy(CheckpointStrategy::Manual),
        );

        let execution = engine.start_workflow("chk", None).unwrap();
        wait_terminal(&engine, &execution.workflow_id).await;

        let history = engine.get_workflow_history(&execution.workflow_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].step_index, 2);
    }

    #[tokio::test]
    async fn test_cancel_workflow_mid_timer() {
        let engine = engine();
        engine.register_workflow(WorkflowDefinition::new(
            "slow",
            vec![WorkflowStep::timer("nap", 60_000)],
        ));

        let execution = engine.start_workflow("slow", None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel_workflow(&execution.workflow_id).unwrap();

        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Cancelled);

        // Cancelling a terminal workflow is rejected.
        assert!(engine.cancel_workflow(&execution.workflow_id).is_err());
    }

    #[tokio::test]
    async fn test_hitl_approval_flow() {
        let engine = engine();
        engine.register_activity("deploy", echo_activity("deploy"), None);
        engine.register_workflow(
            WorkflowDefinition::new(
                "gated",
                vec![WorkflowStep::activity("ship", "deploy").with_approval()],
            )
            .with_hitl(),
        );
        let mut events = engine.subscribe();

        let execution = engine.start_workflow("gated", None).unwrap();

        // Wait for the approval request event.
        let request_id = loop {
            let event = events.recv().await.unwrap();
            if let WorkflowEventKind::ApprovalRequested { request_id, .. } = event.kind {
                break request_id;
            }
        };
        assert_eq!(
            engine.query_workflow(&execution.workflow_id).unwrap().status,
            WorkflowStatus::WaitingApproval
        );

        engine
            .submit_decision(
                &request_id,
                ApprovalDecision {
                    approved: true,
                    comment: None,
                },
            )
            .unwrap();

        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_hitl_rejection_fails_workflow() {
        let engine = engine();
        engine.register_activity("deploy", echo_activity("deploy"), None);
        engine.register_workflow(
            WorkflowDefinition::new(
                "gated",
                vec![WorkflowStep::activity("ship", "deploy").with_approval()],
            )
            .with_hitl(),
        );
        let mut events = engine.subscribe();

        let execution = engine.start_workflow("gated", None).unwrap();
        let request_id = loop {
            let event = events.recv().await.unwrap();
            if let WorkflowEventKind::ApprovalRequested { request_id, .. } = event.kind {
                break request_id;
            }
        };

        engine
            .submit_decision(
                &request_id,
                ApprovalDecision {
                    approved: false,
                    comment: Some("not yet".to_string()),
                },
            )
            .unwrap();

        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Failed);
        assert!(finished.error.unwrap().contains("approval rejected"));
    }

    #[tokio::test]
    async fn test_submit_decision_unknown_request() {
        let engine = engine();
        let err = engine
            .submit_decision(
                "ghost",
                ApprovalDecision {
                    approved: true,
                    comment: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn test_replay_from_checkpoint() {
        let engine = engine();
        let second_runs = Arc::new(AtomicU32::new(0));
        let counter = second_runs.clone();
        engine.register_activity("first", echo_activity("first"), None);
        engine.register_activity(
            "second",
            Arc::new(move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("second done"))
                })
            }),
            None,
        );
        engine.register_workflow(WorkflowDefinition::new(
            "replayable",
            vec![
                WorkflowStep::activity("s1", "first"),
                WorkflowStep::activity("s2", "second"),
            ],
        ));

        let execution = engine.start_workflow("replayable", None).unwrap();
        wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(second_runs.load(Ordering::SeqCst), 1);

        // Replay from the checkpoint taken after step 1: only step 2 reruns.
        let history = engine.get_workflow_history(&execution.workflow_id).unwrap();
        let after_first = history.iter().find(|c| c.step_index == 1).unwrap();

        let replayed = engine
            .replay_from_checkpoint(&execution.workflow_id, &after_first.id)
            .unwrap();
        assert_eq!(replayed.status, WorkflowStatus::Running);
        assert_eq!(replayed.current_step_index, 1);

        let finished = wait_terminal(&engine, &execution.workflow_id).await;
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(second_runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_replay_unknown_checkpoint() {
        let engine = engine();
        engine.register_workflow(WorkflowDefinition::new("w", vec![]));
        let execution = engine.start_workflow("w", None).unwrap();
        wait_terminal(&engine, &execution.workflow_id).await;

        let err = engine
            .replay_from_checkpoint(&execution.workflow_id, "missing")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_query_unknown_workflow() {
        let engine = engine();
        assert!(matches!(
            engine.query_workflow("ghost").unwrap_err(),
            WorkflowError::WorkflowNotFound(_)
        ));
    }
}
