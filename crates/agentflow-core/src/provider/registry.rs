//! In-memory provider registry with change notifications.
//!
//! Reads are concurrent; writes are serialized behind the lock. Enabled
//! flags become visible to new routing decisions immediately.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;

use agentflow_models::ProviderProfile;

use crate::error::{CoreError, Result};

/// Registry change event delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChange {
    Registered(String),
    Updated(String),
    EnabledChanged { id: String, enabled: bool },
    Removed(String),
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Registry of known agent providers.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, ProviderProfile>>,
    changes: broadcast::Sender<ProviderChange>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            providers: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Register a provider or replace its profile.
    pub fn register(&self, provider: ProviderProfile) {
        let id = provider.id.clone();
        let replaced = self
            .providers
            .write()
            .insert(id.clone(), provider)
            .is_some();

        let event = if replaced {
            ProviderChange::Updated(id)
        } else {
            ProviderChange::Registered(id)
        };
        let _ = self.changes.send(event);
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.providers.write().remove(id).is_some();
        if removed {
            let _ = self.changes.send(ProviderChange::Removed(id.to_string()));
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<ProviderProfile> {
        self.providers.read().get(id).cloned()
    }

    /// All registered providers in registration-independent order.
    pub fn get_all(&self) -> Vec<ProviderProfile> {
        let mut all: Vec<ProviderProfile> = self.providers.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// All enabled providers.
    pub fn get_enabled(&self) -> Vec<ProviderProfile> {
        self.get_all().into_iter().filter(|p| p.enabled).collect()
    }

    /// Flip a provider's enabled flag. Immediately visible to new
    /// routing decisions.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut providers = self.providers.write();
        let provider = providers
            .get_mut(id)
            .ok_or_else(|| CoreError::ProviderNotFound(id.to_string()))?;
        provider.enabled = enabled;
        drop(providers);

        let _ = self.changes.send(ProviderChange::EnabledChanged {
            id: id.to_string(),
            enabled,
        });
        Ok(())
    }

    /// Subscribe to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_models::ProviderCapabilities;

    fn provider(id: &str) -> ProviderProfile {
        ProviderProfile::new(id, ProviderCapabilities::default())
    }

    #[test]
    fn test_register_and_get() {
        let registry = ProviderRegistry::new();
        registry.register(provider("claude"));
        registry.register(provider("gemini"));

        assert!(registry.get("claude").is_some());
        assert_eq!(registry.get_all().len(), 2);
        assert!(registry.get("codex").is_none());
    }

    #[test]
    fn test_set_enabled_visible_immediately() {
        let registry = ProviderRegistry::new();
        registry.register(provider("claude"));

        registry.set_enabled("claude", false).unwrap();
        assert!(registry.get_enabled().is_empty());
        assert!(!registry.get("claude").unwrap().enabled);

        registry.set_enabled("claude", true).unwrap();
        assert_eq!(registry.get_enabled().len(), 1);
    }

    #[test]
    fn test_set_enabled_unknown_provider() {
        let registry = ProviderRegistry::new();
        let err = registry.set_enabled("ghost", true).unwrap_err();
        assert!(matches!(err, CoreError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn test_change_events() {
        let registry = ProviderRegistry::new();
        let mut rx = registry.subscribe();

        registry.register(provider("claude"));
        registry.set_enabled("claude", false).unwrap();
        registry.remove("claude");

        assert_eq!(
            rx.recv().await.unwrap(),
            ProviderChange::Registered("claude".to_string())
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ProviderChange::EnabledChanged {
                id: "claude".to_string(),
                enabled: false
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ProviderChange::Removed("claude".to_string())
        );
    }
}
