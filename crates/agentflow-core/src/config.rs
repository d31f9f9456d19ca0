//! Orchestrator configuration surface.
//!
//! Every knob has a default; a TOML file can override any subset. No
//! module-level mutable state: the loaded config is passed into each
//! subsystem at construction.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Victim selection policy for the work-stealing scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StealPolicy {
    Random,
    #[default]
    MostLoaded,
}

/// Load-balancing strategy for the LLM router.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastCost,
    LeastLatency,
    Weighted,
}

/// Retry defaults applied where no per-call policy is given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Checkpointing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Auto-checkpoint interval; 0 disables the timer.
    pub interval_ms: u64,
    /// Per-task cap; oldest checkpoints are pruned above it.
    pub max_per_task: usize,
    /// Age past which cleanup removes checkpoints.
    pub retention_ms: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 0,
            max_per_task: 10,
            retention_ms: 7 * 24 * 60 * 60 * 1_000,
        }
    }
}

/// Work-stealing scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StealingConfig {
    pub policy: StealPolicy,
    /// Victims with fewer queued tasks than this are not stolen from.
    pub min_queue_size_for_steal: usize,
    pub max_steal_attempts: u32,
    pub backoff_delay_ms: u64,
    pub enable_splitting: bool,
}

impl Default for StealingConfig {
    fn default() -> Self {
        Self {
            policy: StealPolicy::MostLoaded,
            min_queue_size_for_steal: 2,
            max_steal_attempts: 3,
            backoff_delay_ms: 10,
            enable_splitting: false,
        }
    }
}

/// Merge coordinator knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// Globs whose matches always go to manual review.
    pub high_risk_globs: Vec<String>,
    /// Similarity in [0, 1] above which a structural merge is attempted.
    pub semantic_similarity_threshold: f64,
    /// Changed-line ceiling for automatic resolution.
    pub max_auto_resolve_lines: usize,
    /// Whether the AI resolution hook may be consulted as a last resort.
    pub enable_ai_resolution: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            high_risk_globs: vec![
                "**/security/**".to_string(),
                ".env*".to_string(),
                "**/migrations/**".to_string(),
            ],
            semantic_similarity_threshold: 0.7,
            max_auto_resolve_lines: 50,
            enable_ai_resolution: false,
        }
    }
}

/// Escalation engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EscalationConfig {
    pub max_retries: u32,
    pub max_approaches: u32,
    pub allow_partial_completion: bool,
    /// Escalate critical stuck tasks straight to a human.
    pub fast_escalation: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_approaches: 2,
            allow_partial_completion: false,
            fast_escalation: true,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub routing_strategy: LoadBalancing,
    /// Refuse submission when no provider matches.
    pub fail_if_no_provider: bool,
    pub max_concurrency: usize,
    pub task_timeout_ms: u64,
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub stale_worker_timeout_ms: i64,
    pub stealing: StealingConfig,
    pub merge: MergeConfig,
    pub escalation: EscalationConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            routing_strategy: LoadBalancing::RoundRobin,
            fail_if_no_provider: true,
            max_concurrency: 4,
            task_timeout_ms: 30 * 60 * 1_000,
            retry: RetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            stale_worker_timeout_ms: 300_000,
            stealing: StealingConfig::default(),
            merge: MergeConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, applying defaults for any
    /// missing section.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config at {}", path.as_ref().display()))?;
        toml::from_str(&raw).context("failed to parse orchestrator config")
    }
}
