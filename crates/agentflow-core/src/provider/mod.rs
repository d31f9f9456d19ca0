//! Provider registry, capability matching and routing policy.

pub mod matcher;
pub mod registry;
pub mod router;

pub use matcher::{CapabilityMatcher, MatchDetail, MatchScore};
pub use registry::{ProviderChange, ProviderRegistry};
pub use router::{ProviderRouter, RouteDecision};
