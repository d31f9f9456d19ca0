//! Task orchestrator - submit / status / cancel / subscribe.
//!
//! Owns the task lifecycle: persists every transition through the state
//! store, routes submissions to providers, drives adapter executions with
//! retry, and publishes the ordered per-task event stream.

pub mod events;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use agentflow_models::{
    AccessMode, AttemptOutcome, Session, Task, TaskDefinition, TaskEvent, TaskResult, TaskStatus,
    UsageRecord,
};
use agentflow_storage::StateStore;
use agentflow_traits::{AgentAdapter, ProjectContext, UsageSink};

use crate::config::OrchestratorConfig;
use crate::error::{CoreError, ErrorKind, Result};
use crate::provider::{ProviderRegistry, ProviderRouter};
use crate::recovery::{RecoveryManager, StuckDetector};

pub use events::{EventBus, EventSubscription};

/// Handle returned from a submission: the task id plus its event stream.
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: String,
    pub events: EventSubscription,
}

struct RunningTask {
    cancel: watch::Sender<bool>,
    adapter_id: String,
    handle: Option<JoinHandle<()>>,
}

/// How one attempt ended.
enum AttemptEnd {
    Completed(TaskResult),
    Failed(String),
    Interrupted,
    CancelRequested,
}

/// Shared internals cloned into each execution task.
#[derive(Clone)]
struct ExecContext {
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    adapters: Arc<DashMap<String, Arc<dyn AgentAdapter>>>,
    running: Arc<DashMap<String, RunningTask>>,
    stuck: Arc<StuckDetector>,
    recovery: Arc<RecoveryManager>,
    usage_sink: Option<Arc<dyn UsageSink>>,
}

/// The orchestration front door.
pub struct TaskOrchestrator {
    registry: Arc<ProviderRegistry>,
    router: ProviderRouter,
    ctx: ExecContext,
}

impl TaskOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        registry: Arc<ProviderRegistry>,
        recovery: Arc<RecoveryManager>,
        stuck: Arc<StuckDetector>,
        usage_sink: Option<Arc<dyn UsageSink>>,
    ) -> Self {
        Self {
            registry,
            router: ProviderRouter::new(),
            ctx: ExecContext {
                config,
                store,
                events: Arc::new(EventBus::new()),
                adapters: Arc::new(DashMap::new()),
                running: Arc::new(DashMap::new()),
                stuck,
                recovery,
                usage_sink,
            },
        }
    }

    /// Register the adapter that executes tasks for its provider id.
    pub fn register_adapter(&self, adapter: Arc<dyn AgentAdapter>) {
        self.ctx.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Global audit feed across all tasks.
    pub fn subscribe_all(&self) -> tokio::sync::broadcast::Receiver<agentflow_models::TaskEventEnvelope> {
        self.ctx.events.subscribe_all()
    }

    /// Submit a task. Idempotent per client-provided id: re-submitting an
    /// existing id (terminal or not) returns a handle to the existing
    /// task without re-execution.
    pub async fn submit(&self, definition: TaskDefinition) -> Result<TaskHandle> {
        if definition.id.trim().is_empty() {
            return Err(CoreError::Validation("task id must not be empty".to_string()));
        }
        if definition.prompt.trim().is_empty() {
            return Err(CoreError::Validation("prompt must not be empty".to_string()));
        }

        if let Some(existing) = self.ctx.store.get_task(&definition.id)? {
            debug!(task_id = %existing.id, "Idempotent resubmission");
            return Ok(TaskHandle {
                events: self.ctx.events.subscribe(&existing.id),
                task_id: existing.id,
            });
        }

        let route = match self.router.select(&self.registry, &definition) {
            Ok(route) => Some(route),
            Err(CoreError::NoProviderAvailable(id)) if !self.ctx.config.fail_if_no_provider => {
                warn!(task_id = %id, "No provider available; task parked pending");
                None
            }
            Err(error) => return Err(error),
        };

        let mut task = Task::from_definition(definition);

        if let Some(route) = &route {
            let session = self.find_or_create_session(&task, &route.provider_id)?;
            task.session_id = Some(session.id);
        }
        self.ctx.store.put_task(&task)?;
        info!(task_id = %task.id, provider = ?route.as_ref().map(|r| &r.provider_id), "Task submitted");

        // Subscribe before execution starts so no event can be missed.
        let subscription = self.ctx.events.subscribe(&task.id);

        if let Some(route) = route {
            let (cancel_tx, cancel_rx) = watch::channel(false);
            self.ctx.running.insert(
                task.id.clone(),
                RunningTask {
                    cancel: cancel_tx,
                    adapter_id: route.provider_id.clone(),
                    handle: None,
                },
            );

            let ctx = self.ctx.clone();
            let task_id = task.id.clone();
            let handle = tokio::spawn(run_task(
                ctx,
                task_id.clone(),
                route.provider_id,
                route.access_mode,
                cancel_rx,
            ));
            if let Some(mut entry) = self.ctx.running.get_mut(&task_id) {
                entry.handle = Some(handle);
            }
        }

        Ok(TaskHandle {
            task_id: task.id,
            events: subscription,
        })
    }

    fn find_or_create_session(&self, task: &Task, provider_id: &str) -> Result<Session> {
        let repository_key = &task.definition.repository_path;
        let existing = self.ctx.store.list_sessions()?.into_iter().find(|s| {
            s.project_id == task.definition.project_key
                && &s.repository_key == repository_key
                && s.provider_id == provider_id
        });

        match existing {
            Some(session) => Ok(session),
            None => {
                let session = Session::new(
                    task.definition.project_key.clone(),
                    repository_key.clone(),
                    provider_id,
                );
                self.ctx.store.put_session(&session)?;
                Ok(session)
            }
        }
    }

    /// Current status of a task.
    pub fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.get_task(task_id)?.status)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.ctx
            .store
            .get_task(task_id)?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    /// Cancel a pending, running or paused task. Sends a best-effort
    /// interrupt to the adapter and publishes the terminal event.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let mut task = self.get_task(task_id)?;
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }

        // Clone the adapter handle out so no map guard is held across the
        // interrupt await.
        let adapter_id = self.ctx.running.get(task_id).map(|entry| {
            let _ = entry.cancel.send(true);
            entry.adapter_id.clone()
        });
        if let Some(adapter_id) = adapter_id
            && let Some(adapter) = self.ctx.adapters.get(&adapter_id).map(|a| a.clone())
            && let Err(error) = adapter.interrupt().await
        {
            warn!(task_id = %task_id, error = %error, "Adapter interrupt failed");
        }

        task.cancel();
        self.ctx.store.put_task(&task)?;
        self.ctx.events.publish(task_id, TaskEvent::Interrupt);
        self.ctx.running.remove(task_id);
        self.ctx.recovery.clear_recovery_points(task_id);
        info!(task_id = %task_id, "Task cancelled");
        Ok(())
    }

    /// Pause a running task.
    pub fn pause(&self, task_id: &str) -> Result<()> {
        let mut task = self.get_task(task_id)?;
        if !task.status.can_transition_to(TaskStatus::Paused) {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Paused,
            });
        }
        task.pause();
        Ok(self.ctx.store.put_task(&task)?)
    }

    /// Resume a paused task.
    pub fn resume(&self, task_id: &str) -> Result<()> {
        let mut task = self.get_task(task_id)?;
        if task.status != TaskStatus::Paused {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.resume();
        Ok(self.ctx.store.put_task(&task)?)
    }

    /// Subscribe to a task's ordered event stream (with replay).
    pub fn subscribe(&self, task_id: &str) -> Result<EventSubscription> {
        // Verify the task exists so unknown ids fail fast.
        self.get_task(task_id)?;
        Ok(self.ctx.events.subscribe(task_id))
    }

    /// Abort every in-flight execution. Tasks stay in their last
    /// persisted state for recovery on the next start.
    pub fn shutdown(&self) {
        for entry in self.ctx.running.iter() {
            let _ = entry.cancel.send(true);
            if let Some(handle) = &entry.handle {
                handle.abort();
            }
        }
        self.ctx.running.clear();
    }
}

/// Attempt loop for one task.
async fn run_task(
    ctx: ExecContext,
    task_id: String,
    provider_id: String,
    access_mode: AccessMode,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let max_attempts = ctx.config.retry.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut start_published = false;

    loop {
        attempt += 1;

        let mut task = match ctx.store.get_task(&task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                error!(task_id = %task_id, "Task vanished before execution");
                return;
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "Failed to load task");
                return;
            }
        };
        if task.status.is_terminal() {
            return;
        }

        task.start(&provider_id);
        if let Err(err) = ctx.store.put_task(&task) {
            error!(task_id = %task_id, error = %err, "Failed to persist running state");
            return;
        }
        if !start_published {
            ctx.events.publish(&task_id, TaskEvent::Start);
            start_published = true;
        }

        let end = execute_attempt(&ctx, &task, &provider_id, &mut cancel_rx).await;

        match end {
            AttemptEnd::Completed(result) => {
                ctx.stuck.record_attempt(
                    &task_id,
                    AttemptOutcome::Success,
                    None,
                    result.files_changed.clone(),
                );
                task.complete(result.clone());
                if let Err(err) = ctx.store.put_task(&task) {
                    error!(task_id = %task_id, error = %err, "Failed to persist completion");
                }
                record_usage(&ctx, &provider_id, access_mode).await;
                ctx.events.publish(
                    &task_id,
                    TaskEvent::Complete {
                        result: Some(result),
                    },
                );
                ctx.running.remove(&task_id);
                info!(task_id = %task_id, attempts = attempt, "Task completed");
                return;
            }
            AttemptEnd::CancelRequested => {
                // cancel() already persisted the terminal state and
                // published the interrupt event.
                debug!(task_id = %task_id, "Execution loop observed cancellation");
                return;
            }
            AttemptEnd::Interrupted => {
                task.cancel();
                if let Err(err) = ctx.store.put_task(&task) {
                    error!(task_id = %task_id, error = %err, "Failed to persist interrupt");
                }
                ctx.events.publish(&task_id, TaskEvent::Interrupt);
                ctx.running.remove(&task_id);
                return;
            }
            AttemptEnd::Failed(message) => {
                ctx.stuck.record_attempt(
                    &task_id,
                    AttemptOutcome::Failure,
                    Some(&message),
                    Vec::new(),
                );

                let kind = ErrorKind::classify(&message);
                if kind.is_retryable() && attempt < max_attempts {
                    let delay = ctx.recovery.delay_for(attempt);
                    warn!(
                        task_id = %task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                task.fail(message.clone());
                if let Err(err) = ctx.store.put_task(&task) {
                    error!(task_id = %task_id, error = %err, "Failed to persist failure");
                }
                ctx.events.publish(&task_id, TaskEvent::Error { message: message.clone() });
                ctx.running.remove(&task_id);
                error!(task_id = %task_id, attempts = attempt, error = %message, "Task failed");
                return;
            }
        }
    }
}

/// Drive one adapter execution to its terminal event.
async fn execute_attempt(
    ctx: &ExecContext,
    task: &Task,
    provider_id: &str,
    cancel_rx: &mut watch::Receiver<bool>,
) -> AttemptEnd {
    let Some(adapter) = ctx.adapters.get(provider_id).map(|a| a.clone()) else {
        return AttemptEnd::Failed(format!("fatal: no adapter registered for {provider_id}"));
    };

    let context = ProjectContext {
        project_key: task.definition.project_key.clone(),
        repository_path: task.definition.repository_path.clone(),
        metadata: Default::default(),
    };
    if let Err(error) = adapter.set_project_context(context).await {
        return AttemptEnd::Failed(format!("failed to set project context: {error}"));
    }

    let mut stream = match adapter.execute(task).await {
        Ok(stream) => stream,
        Err(error) => return AttemptEnd::Failed(error.to_string()),
    };

    let deadline = Duration::from_millis(ctx.config.task_timeout_ms.max(1));
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);

    let mut collected_output = String::new();

    loop {
        tokio::select! {
            // A failed pattern match (sender dropped) disables this branch
            // instead of spinning.
            Ok(()) = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return AttemptEnd::CancelRequested;
                }
            }
            _ = &mut timeout => {
                if let Err(error) = adapter.interrupt().await {
                    warn!(task_id = %task.id, error = %error, "Interrupt after timeout failed");
                }
                return AttemptEnd::Failed(format!(
                    "timeout: task exceeded {}ms",
                    ctx.config.task_timeout_ms
                ));
            }
            event = stream.recv() => {
                match event {
                    Some(TaskEvent::Start) => {
                        // The orchestrator publishes its own start event;
                        // adapter start markers are absorbed.
                    }
                    Some(TaskEvent::Output { content }) => {
                        collected_output.push_str(&content);
                        ctx.events.publish(&task.id, TaskEvent::Output { content });
                    }
                    Some(TaskEvent::Progress { percent, message }) => {
                        ctx.events.publish(&task.id, TaskEvent::Progress { percent, message });
                    }
                    Some(TaskEvent::Complete { result }) => {
                        let result = result.unwrap_or_else(|| TaskResult::text(collected_output.clone()));
                        return AttemptEnd::Completed(result);
                    }
                    Some(TaskEvent::Error { message }) => {
                        return AttemptEnd::Failed(message);
                    }
                    Some(TaskEvent::Interrupt) => {
                        return AttemptEnd::Interrupted;
                    }
                    None => {
                        return AttemptEnd::Failed(
                            "adapter stream ended without a terminal event".to_string(),
                        );
                    }
                }
            }
        }
    }
}

async fn record_usage(ctx: &ExecContext, provider_id: &str, access_mode: AccessMode) {
    let record = UsageRecord::new(provider_id, access_mode);
    if let Err(error) = ctx.store.append_usage(&record) {
        warn!(provider = %provider_id, error = %error, "Failed to persist usage record");
    }
    if let Some(sink) = &ctx.usage_sink
        && let Err(error) = sink.record_usage(record).await
    {
        warn!(provider = %provider_id, error = %error, "Usage sink rejected record");
    }
}
