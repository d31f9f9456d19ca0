//! Routing policy: choose a provider and access mode for a task.
//!
//! Preferred providers are honored in order when they qualify; otherwise
//! the capability matcher ranks all enabled providers. The access mode is
//! the enabled mode with the lowest priority number (subscription before
//! api before free in the default profiles).

use tracing::debug;

use agentflow_models::{AccessMode, CapabilityRequirements, TaskDefinition};

use crate::error::{CoreError, Result};
use crate::provider::matcher::CapabilityMatcher;
use crate::provider::registry::ProviderRegistry;

/// Outcome of a routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub provider_id: String,
    pub access_mode: AccessMode,
    pub score: u32,
}

/// Chooses providers for submitted tasks.
pub struct ProviderRouter {
    matcher: CapabilityMatcher,
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            matcher: CapabilityMatcher::new(),
        }
    }

    /// Pick a provider for the given definition, or fail with
    /// `NoProviderAvailable` when nothing qualifies.
    pub fn select(
        &self,
        registry: &ProviderRegistry,
        definition: &TaskDefinition,
    ) -> Result<RouteDecision> {
        let requirements = definition.requirements.clone().unwrap_or_default();
        let enabled = registry.get_enabled();

        // Honor explicit preferences first, in order.
        for preferred in &definition.preferred_providers {
            if let Some(provider) = enabled.iter().find(|p| &p.id == preferred)
                && self.matcher.meets_requirements(provider, &requirements)
            {
                let score = self.matcher.score_provider(provider, &requirements);
                return self.decide(provider.id.clone(), score.score, registry);
            }
        }

        let best = self
            .matcher
            .find_best_match(&enabled, &requirements)
            .ok_or_else(|| CoreError::NoProviderAvailable(definition.id.clone()))?;

        debug!(
            task_id = %definition.id,
            provider = %best.provider_id,
            score = best.score,
            "Routed task to provider"
        );
        self.decide(best.provider_id, best.score, registry)
    }

    fn decide(
        &self,
        provider_id: String,
        score: u32,
        registry: &ProviderRegistry,
    ) -> Result<RouteDecision> {
        let provider = registry
            .get(&provider_id)
            .ok_or_else(|| CoreError::ProviderNotFound(provider_id.clone()))?;

        let access_mode = provider
            .preferred_access_modes()
            .first()
            .map(|m| m.mode)
            .ok_or_else(|| CoreError::NoProviderAvailable(provider_id.clone()))?;

        Ok(RouteDecision {
            provider_id,
            access_mode,
            score,
        })
    }

    /// Expose the matcher for callers that only need scoring.
    pub fn matcher(&self) -> &CapabilityMatcher {
        &self.matcher
    }

    /// Requirements helper used by the orchestrator when a definition has
    /// no explicit requirements.
    pub fn effective_requirements(definition: &TaskDefinition) -> CapabilityRequirements {
        definition.requirements.clone().unwrap_or_default()
    }
}
