//! Usage accounting records, append-only.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing channel for a provider call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Subscription,
    Api,
    Free,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Api => "api",
            Self::Free => "free",
        }
    }
}

/// One append-only usage entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub id: String,
    pub provider_id: String,
    pub access_mode: AccessMode,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl UsageRecord {
    pub fn new(provider_id: impl Into<String>, access_mode: AccessMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider_id: provider_id.into(),
            access_mode,
            timestamp: crate::now_millis(),
            request_count: 1,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: None,
        }
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}
