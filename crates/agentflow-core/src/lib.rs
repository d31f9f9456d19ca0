//! AgentFlow Core - the orchestration engine
//!
//! Accepts coding-task submissions, routes them across heterogeneous agent
//! providers under cost policies, runs composite work in parallel over a
//! worker pool, and recovers autonomously from failures.
//!
//! # Subsystems
//!
//! - [`orchestrator`] - task lifecycle: submit / status / cancel / events
//! - [`provider`] - registry, capability matcher and routing policy
//! - [`llm`] - multi-provider completion router with fallback chains
//! - [`scheduler`] - dependency graph planning, stage execution, work stealing
//! - [`worker`] - worker pool and registry
//! - [`recovery`] - checkpoints, retry/rollback/restore, stuck detection,
//!   escalation and auto-fix
//! - [`merge`] - reconciliation of parallel worker changes

pub mod config;
pub mod error;
pub mod llm;
pub mod merge;
pub mod orchestrator;
pub mod provider;
pub mod recovery;
pub mod scheduler;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{CoreError, ErrorKind, Result};
pub use orchestrator::TaskOrchestrator;
