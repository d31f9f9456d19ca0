//! Capability matching and scoring for provider selection.
//!
//! `meets_requirements` uses existential semantics: any requested
//! capability or language present qualifies the provider. `score_provider`
//! rewards proportional coverage, so ranking still prefers fuller matches.

use agentflow_models::{Capability, CapabilityRequirements, ProviderProfile};

const CAPABILITY_WEIGHT: f64 = 30.0;
const LANGUAGE_WEIGHT: f64 = 20.0;
const CONTEXT_WEIGHT: f64 = 20.0;
const STREAMING_WEIGHT: f64 = 10.0;
const MCP_WEIGHT: f64 = 10.0;
const RESUME_WEIGHT: f64 = 10.0;

/// Which requested dimensions a provider satisfied.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchDetail {
    pub capabilities: Vec<Capability>,
    pub languages: Vec<String>,
    pub context: bool,
    pub streaming: bool,
    pub mcp: bool,
    pub resume: bool,
}

/// Composite score in [0, 100] with the matched dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchScore {
    pub provider_id: String,
    pub score: u32,
    pub matches: MatchDetail,
}

/// Stateless matcher over provider profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityMatcher;

impl CapabilityMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Hard filter: (A) at least one requested capability present,
    /// (B) at least one requested language supported (case-insensitive),
    /// (C) context window at least the requested minimum,
    /// (D) streaming/MCP/resume flags satisfied when required.
    pub fn meets_requirements(
        &self,
        provider: &ProviderProfile,
        req: &CapabilityRequirements,
    ) -> bool {
        let caps = &provider.capabilities;

        if !req.capabilities.is_empty() && !req.capabilities.iter().any(|c| caps.has(*c)) {
            return false;
        }
        if !req.languages.is_empty() && !req.languages.iter().any(|l| caps.supports_language(l)) {
            return false;
        }
        if caps.max_context_tokens < req.min_context_tokens {
            return false;
        }
        if req.requires_streaming && !caps.supports_streaming {
            return false;
        }
        if req.requires_mcp && !caps.supports_mcp {
            return false;
        }
        if req.requires_resume && !caps.supports_resume {
            return false;
        }
        true
    }

    /// Additive composite score. An unrequired dimension contributes its
    /// full weight; requested dimensions contribute proportionally to the
    /// fraction matched.
    pub fn score_provider(
        &self,
        provider: &ProviderProfile,
        req: &CapabilityRequirements,
    ) -> MatchScore {
        let caps = &provider.capabilities;
        let mut matches = MatchDetail::default();
        let mut score = 0.0;

        if req.capabilities.is_empty() {
            score += CAPABILITY_WEIGHT;
        } else {
            matches.capabilities = req
                .capabilities
                .iter()
                .copied()
                .filter(|c| caps.has(*c))
                .collect();
            score += CAPABILITY_WEIGHT * matches.capabilities.len() as f64
                / req.capabilities.len() as f64;
        }

        if req.languages.is_empty() {
            score += LANGUAGE_WEIGHT;
        } else {
            matches.languages = req
                .languages
                .iter()
                .filter(|l| caps.supports_language(l))
                .cloned()
                .collect();
            score += LANGUAGE_WEIGHT * matches.languages.len() as f64 / req.languages.len() as f64;
        }

        if req.min_context_tokens == 0 {
            matches.context = true;
            score += CONTEXT_WEIGHT;
        } else {
            matches.context = caps.max_context_tokens >= req.min_context_tokens;
            // Larger windows score higher: half weight at exactly the
            // minimum, full weight at twice the minimum or beyond.
            let ratio = caps.max_context_tokens as f64 / (2.0 * req.min_context_tokens as f64);
            score += CONTEXT_WEIGHT * ratio.min(1.0);
        }

        matches.streaming = !req.requires_streaming || caps.supports_streaming;
        if matches.streaming {
            score += STREAMING_WEIGHT;
        }
        matches.mcp = !req.requires_mcp || caps.supports_mcp;
        if matches.mcp {
            score += MCP_WEIGHT;
        }
        matches.resume = !req.requires_resume || caps.supports_resume;
        if matches.resume {
            score += RESUME_WEIGHT;
        }

        MatchScore {
            provider_id: provider.id.clone(),
            score: score.clamp(0.0, 100.0).round() as u32,
            matches,
        }
    }

    /// Score providers and sort descending, dropping zero scores.
    /// Ties preserve input order.
    pub fn rank_providers(
        &self,
        providers: &[ProviderProfile],
        req: &CapabilityRequirements,
    ) -> Vec<MatchScore> {
        let mut scored: Vec<MatchScore> = providers
            .iter()
            .map(|p| self.score_provider(p, req))
            .filter(|s| s.score > 0)
            .collect();
        // Stable sort keeps input order on equal scores.
        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored
    }

    /// Best provider meeting the hard requirements, or None.
    pub fn find_best_match(
        &self,
        providers: &[ProviderProfile],
        req: &CapabilityRequirements,
    ) -> Option<MatchScore> {
        let eligible: Vec<ProviderProfile> = providers
            .iter()
            .filter(|p| self.meets_requirements(p, req))
            .cloned()
            .collect();
        self.rank_providers(&eligible, req).into_iter().next()
    }
}
