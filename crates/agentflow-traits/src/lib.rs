//! AgentFlow Traits - external contracts consumed by the orchestration core
//!
//! Defines the [`AgentAdapter`] interface the core drives coding agents
//! through, and the [`UsageSink`] contract cost accounting flows into.
//! Concrete adapters (claude-code, gemini-cli, ...) live outside the core.

pub mod adapter;
pub mod error;
pub mod usage;

pub use adapter::{AgentAdapter, EventStream, ProjectContext, RateLimitDetector};
pub use error::AdapterError;
pub use usage::UsageSink;
