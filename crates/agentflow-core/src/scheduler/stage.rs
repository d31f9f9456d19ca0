//! Stage scheduler - coarse DAG-driven parallel execution.
//!
//! Dispatches each stage's tasks concurrently to the worker pool and
//! waits at the stage boundary before starting the next. Failures are
//! handled per the configured strategy: retry through the recovery
//! manager, abort the whole plan, or continue past failed tasks.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use agentflow_models::{ExecutionPlan, TaskNode};

use crate::error::Result;
use crate::recovery::RecoveryManager;
use crate::worker::WorkerPool;

/// Executes one plan node. Implementations typically drive an agent
/// adapter or an orchestrator submission.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &TaskNode) -> Result<Value>;
}

/// What to do when a stage task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureStrategy {
    /// Wrap each task in the recovery manager's retry policy.
    Retry,
    /// Fail the entire plan at the first failed stage.
    #[default]
    Abort,
    /// Mark failed tasks and keep going.
    Continue,
}

/// Outcome of one dispatched node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeExecution {
    pub node_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of a whole plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub executions: Vec<NodeExecution>,
}

/// DAG-driven scheduler over the worker pool.
pub struct StageScheduler {
    pool: WorkerPool,
    strategy: FailureStrategy,
    recovery: Option<Arc<RecoveryManager>>,
}

impl StageScheduler {
    pub fn new(pool: WorkerPool, strategy: FailureStrategy) -> Self {
        Self {
            pool,
            strategy,
            recovery: None,
        }
    }

    /// Attach the recovery manager used by the `Retry` strategy.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Execute the plan stage by stage. Each stage is a barrier: all of
    /// its tasks finish before the next stage starts.
    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn NodeExecutor>,
    ) -> ExecutionResult {
        let total_tasks = plan.total_tasks();
        let mut executions: Vec<NodeExecution> = Vec::with_capacity(total_tasks);
        let mut aborted = false;

        for stage in &plan.stages {
            info!(
                stage = stage.index,
                tasks = stage.tasks.len(),
                "Dispatching stage"
            );

            let nodes: Vec<&TaskNode> = stage
                .tasks
                .iter()
                .filter_map(|id| plan.node(id))
                .collect();

            let futures: Vec<_> = nodes
                .iter()
                .map(|node| self.run_node(node, executor.clone()))
                .collect();
            let stage_results = self.pool.run_all(futures).await;

            let stage_failed = stage_results.iter().any(|e| !e.success);
            executions.extend(stage_results);

            if stage_failed && self.strategy == FailureStrategy::Abort {
                error!(stage = stage.index, "Stage failed; aborting plan");
                aborted = true;
                break;
            }
        }

        let completed_tasks = executions.iter().filter(|e| e.success).count();
        let failed_tasks = executions.iter().filter(|e| !e.success).count();

        ExecutionResult {
            success: !aborted && failed_tasks == 0 && completed_tasks == total_tasks,
            total_tasks,
            completed_tasks,
            failed_tasks,
            executions,
        }
    }

    async fn run_node(&self, node: &TaskNode, executor: Arc<dyn NodeExecutor>) -> NodeExecution {
        let started = Instant::now();

        let result = match (self.strategy, &self.recovery) {
            (FailureStrategy::Retry, Some(recovery)) => {
                recovery
                    .with_retry(&node.id, |_attempt| executor.execute(node))
                    .await
            }
            _ => executor.execute(node).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => NodeExecution {
                node_id: node.id.clone(),
                success: true,
                output: Some(output),
                error: None,
                duration_ms,
            },
            Err(err) => NodeExecution {
                node_id: node.id.clone(),
                success: false,
                output: None,
                error: Some(err.to_string()),
                duration_ms,
            },
        }
    }
}
