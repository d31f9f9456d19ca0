//! Multi-provider LLM completion routing.
//!
//! Routes completion calls through fallback chains with health tracking,
//! load balancing and cost accounting.

pub mod cost;
pub mod router;

pub use cost::CostTracker;
pub use router::{
    BackendCompletion, ChainConfig, CompletionBackend, CostRates, LlmProvider, LlmRequest,
    LlmResponse, LlmRouter, LlmRouterConfig, LlmUsage, RouterMetrics,
};
