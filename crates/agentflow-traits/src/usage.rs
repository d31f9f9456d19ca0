//! Cost accounting sink consumed by the routers.

use async_trait::async_trait;

use agentflow_models::UsageRecord;

/// Receives usage records from the orchestrator and LLM router.
///
/// Implementations typically append to the state store and keep rolling
/// aggregates for budget enforcement.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record one usage entry. Append-only.
    async fn record_usage(&self, record: UsageRecord) -> anyhow::Result<()>;

    /// Total cost in USD accumulated since local midnight.
    async fn daily_cost_usd(&self) -> anyhow::Result<f64>;
}
