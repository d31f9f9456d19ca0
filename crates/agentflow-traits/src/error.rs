//! Error types for adapter interactions.

use thiserror::Error;

/// Errors surfaced by an [`crate::AgentAdapter`] implementation.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter unavailable: {0}")]
    Unavailable(String),

    #[error("adapter initialization failed: {0}")]
    Initialization(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("execution interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;
