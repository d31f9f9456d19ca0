//! Session model - an ongoing work context with a provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A conversation/work context bound to a provider. Created on the first
/// task in a context, mutated only by the orchestrator, destroyed only on
/// explicit cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub repository_key: String,
    pub provider_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Session {
    pub fn new(
        project_id: impl Into<String>,
        repository_key: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        let now = crate::now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            repository_key: repository_key.into(),
            provider_id: provider_id.into(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Record a mutation timestamp.
    pub fn touch(&mut self) {
        self.updated_at = crate::now_millis();
    }
}
