//! Autonomous failure recovery.
//!
//! Checkpoints, retry with backoff, rollback to recovery points, restore
//! from snapshots, stuck detection, escalation policy and the auto-fix
//! loop.

pub mod autofix;
pub mod checkpoint;
pub mod escalation;
pub mod manager;
pub mod stuck;

pub use autofix::{
    AutoFixEngine, AutoFixGates, AutoFixReport, AutoFixStats, FixContext, FixOutcome, FixStrategy,
    ValidationIssue,
};
pub use checkpoint::{
    CheckpointManager, CheckpointStore, DurableCheckpointStore, InMemoryCheckpointStore,
};
pub use escalation::{EscalationContext, EscalationEngine};
pub use manager::{RecoveryManager, RecoveryOutcome, RecoveryStrategy};
pub use stuck::{StuckDetector, StuckDetectorConfig};
