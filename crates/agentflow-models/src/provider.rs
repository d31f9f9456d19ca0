//! Provider profiles, capabilities and routing requirements.

use serde::{Deserialize, Serialize};

use crate::usage::AccessMode;

/// Task capabilities a coding agent can offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CodeGeneration,
    CodeReview,
    Refactoring,
    Testing,
    Documentation,
    Debugging,
}

/// Capability surface advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderCapabilities {
    #[serde(default)]
    pub code_generation: bool,
    #[serde(default)]
    pub code_review: bool,
    #[serde(default)]
    pub refactoring: bool,
    #[serde(default)]
    pub testing: bool,
    #[serde(default)]
    pub documentation: bool,
    #[serde(default)]
    pub debugging: bool,
    /// Supported languages, matched case-insensitively.
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub max_context_tokens: u64,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_mcp: bool,
    #[serde(default)]
    pub supports_resume: bool,
}

impl ProviderCapabilities {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::CodeGeneration => self.code_generation,
            Capability::CodeReview => self.code_review,
            Capability::Refactoring => self.refactoring,
            Capability::Testing => self.testing,
            Capability::Documentation => self.documentation,
            Capability::Debugging => self.debugging,
        }
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// Requested capabilities for routing a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CapabilityRequirements {
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub min_context_tokens: u64,
    #[serde(default)]
    pub requires_streaming: bool,
    #[serde(default)]
    pub requires_mcp: bool,
    #[serde(default)]
    pub requires_resume: bool,
}

impl CapabilityRequirements {
    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn languages<S: Into<String>>(mut self, languages: impl IntoIterator<Item = S>) -> Self {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_context(mut self, tokens: u64) -> Self {
        self.min_context_tokens = tokens;
        self
    }
}

/// Rate limits attached to a provider or one of its access modes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
}

/// One billing channel of a provider. Lower priority number = preferred.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessModeConfig {
    pub mode: AccessMode,
    pub enabled: bool,
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimits>,
}

/// A registered coding-agent provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderProfile {
    pub id: String,
    pub enabled: bool,
    pub access_modes: Vec<AccessModeConfig>,
    pub capabilities: ProviderCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimits>,
}

impl ProviderProfile {
    pub fn new(id: impl Into<String>, capabilities: ProviderCapabilities) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            access_modes: vec![AccessModeConfig {
                mode: AccessMode::Api,
                enabled: true,
                priority: 0,
                rate_limits: None,
            }],
            capabilities,
            rate_limits: None,
        }
    }

    /// Enabled access modes sorted by ascending priority number.
    pub fn preferred_access_modes(&self) -> Vec<&AccessModeConfig> {
        let mut modes: Vec<&AccessModeConfig> =
            self.access_modes.iter().filter(|m| m.enabled).collect();
        modes.sort_by_key(|m| m.priority);
        modes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_match_case_insensitive() {
        let caps = ProviderCapabilities {
            languages: vec!["TypeScript".to_string(), "rust".to_string()],
            ..Default::default()
        };
        assert!(caps.supports_language("typescript"));
        assert!(caps.supports_language("RUST"));
        assert!(!caps.supports_language("python"));
    }

    #[test]
    fn test_preferred_access_modes_sorted() {
        let provider = ProviderProfile {
            id: "claude".to_string(),
            enabled: true,
            access_modes: vec![
                AccessModeConfig {
                    mode: AccessMode::Api,
                    enabled: true,
                    priority: 2,
                    rate_limits: None,
                },
                AccessModeConfig {
                    mode: AccessMode::Subscription,
                    enabled: true,
                    priority: 1,
                    rate_limits: None,
                },
                AccessModeConfig {
                    mode: AccessMode::Free,
                    enabled: false,
                    priority: 0,
                    rate_limits: None,
                },
            ],
            capabilities: ProviderCapabilities::default(),
            rate_limits: None,
        };

        let modes = provider.preferred_access_modes();
        assert_eq!(modes.len(), 2);
        assert_eq!(modes[0].mode, AccessMode::Subscription);
        assert_eq!(modes[1].mode, AccessMode::Api);
    }
}
