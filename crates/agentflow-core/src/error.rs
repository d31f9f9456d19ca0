//! Error types for the orchestration core.
//!
//! Recovery decisions key off [`ErrorKind`], which classifies failures into
//! the taxonomy the recovery manager and escalation engine understand.

use thiserror::Error;

use agentflow_models::TaskStatus;
use agentflow_traits::AdapterError;

/// Failure classification used by retry, recovery and escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network-level failure, retryable.
    Network,
    /// Deadline exceeded, retryable.
    Timeout,
    /// Provider rate limit, retryable after cooldown.
    RateLimit,
    /// Transient condition, retryable.
    Temporary,
    /// Persisted state is corrupt; restore from checkpoint.
    CorruptState,
    /// Repeated attempts without progress; roll back.
    Stall,
    /// Unrecoverable; abort immediately.
    Fatal,
    /// Referenced entity does not exist; fails without side effects.
    NotFound,
    /// Bad caller input; no state change.
    Validation,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Whether failures of this kind are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Temporary
        )
    }

    /// Classify a raw error message into a kind. Signal phrases follow the
    /// taxonomy: rate-limit markers, stall markers ("stuck", "deadlock",
    /// "loop"), corruption markers ("corrupted", "invalid state") and fatal
    /// markers.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            Self::RateLimit
        } else if lower.contains("stuck") || lower.contains("deadlock") || lower.contains("loop") {
            Self::Stall
        } else if lower.contains("corrupt") || lower.contains("invalid state") {
            Self::CorruptState
        } else if lower.contains("fatal") || lower.contains("unrecoverable") {
            Self::Fatal
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("unreachable")
        {
            Self::Network
        } else if lower.contains("temporar") || lower.contains("unavailable") {
            Self::Temporary
        } else {
            Self::Other
        }
    }
}

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("no provider available for task {0}")]
    NoProviderAvailable(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("illegal status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("dependency cycle detected involving: {0}")]
    CircularDependency(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("rate limit: {0}")]
    RateLimited(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Map this error into the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound(_)
            | Self::SessionNotFound(_)
            | Self::CheckpointNotFound(_)
            | Self::ProviderNotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) | Self::InvalidTransition { .. } | Self::CircularDependency(_) => {
                ErrorKind::Validation
            }
            Self::RateLimited(_) => ErrorKind::RateLimit,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Cancelled => ErrorKind::Other,
            Self::NoProviderAvailable(_) => ErrorKind::Temporary,
            Self::Adapter(e) => match e {
                AdapterError::RateLimited { .. } => ErrorKind::RateLimit,
                AdapterError::Unavailable(_) => ErrorKind::Temporary,
                AdapterError::Interrupted => ErrorKind::Other,
                _ => ErrorKind::classify(&e.to_string()),
            },
            Self::Execution(message) => ErrorKind::classify(message),
            Self::Storage(e) => ErrorKind::classify(&e.to_string()),
            Self::Json(_) => ErrorKind::CorruptState,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(ErrorKind::classify("429 rate limit exceeded"), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::classify("HTTP 429"), ErrorKind::RateLimit);
    }

    #[test]
    fn test_classify_stall_and_corruption() {
        assert_eq!(ErrorKind::classify("agent appears stuck"), ErrorKind::Stall);
        assert_eq!(ErrorKind::classify("deadlock in scheduler"), ErrorKind::Stall);
        assert_eq!(ErrorKind::classify("retry loop detected"), ErrorKind::Stall);
        assert_eq!(ErrorKind::classify("checkpoint corrupted"), ErrorKind::CorruptState);
        assert_eq!(ErrorKind::classify("invalid state snapshot"), ErrorKind::CorruptState);
    }

    #[test]
    fn test_classify_retryable() {
        assert!(ErrorKind::classify("network unreachable").is_retryable());
        assert!(ErrorKind::classify("request timed out").is_retryable());
        assert!(ErrorKind::classify("service temporarily unavailable").is_retryable());
        assert!(!ErrorKind::classify("fatal: disk gone").is_retryable());
    }

    #[test]
    fn test_core_error_kind_mapping() {
        assert_eq!(
            CoreError::TaskNotFound("t1".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::Validation("missing prompt".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CoreError::RateLimited("429".to_string()).kind(),
            ErrorKind::RateLimit
        );
        assert!(CoreError::Timeout("slow".to_string()).is_retryable());
        assert!(!CoreError::Fatal("broken".to_string()).is_retryable());
    }
}
