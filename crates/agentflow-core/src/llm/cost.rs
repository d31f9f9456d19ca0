//! Cost tracker - usage accounting over the state store.
//!
//! Appends every record to the durable usage log and keeps an in-memory
//! daily aggregate for fast budget checks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use agentflow_models::UsageRecord;
use agentflow_storage::AsyncStateStore;
use agentflow_traits::UsageSink;

#[derive(Default, Clone, Copy)]
struct DayTotals {
    cost_usd: f64,
    requests: u64,
}

/// Durable usage sink with daily aggregates.
pub struct CostTracker {
    store: AsyncStateStore,
    /// (provider_id, day ordinal) -> totals
    daily: Mutex<HashMap<(String, i64), DayTotals>>,
}

impl CostTracker {
    pub fn new(store: AsyncStateStore) -> Self {
        Self {
            store,
            daily: Mutex::new(HashMap::new()),
        }
    }

    fn day_ordinal(timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(86_400_000)
    }

    /// Total cost across providers for the current UTC day.
    pub fn daily_cost(&self) -> f64 {
        let today = Self::day_ordinal(agentflow_models::now_millis());
        self.daily
            .lock()
            .iter()
            .filter(|((_, day), _)| *day == today)
            .map(|(_, totals)| totals.cost_usd)
            .sum()
    }

    /// Today's cost for one provider.
    pub fn daily_cost_for(&self, provider_id: &str) -> f64 {
        let today = Self::day_ordinal(agentflow_models::now_millis());
        self.daily
            .lock()
            .get(&(provider_id.to_string(), today))
            .map(|t| t.cost_usd)
            .unwrap_or(0.0)
    }

    /// Today's request count for one provider.
    pub fn daily_requests_for(&self, provider_id: &str) -> u64 {
        let today = Self::day_ordinal(agentflow_models::now_millis());
        self.daily
            .lock()
            .get(&(provider_id.to_string(), today))
            .map(|t| t.requests)
            .unwrap_or(0)
    }

    /// Replay the durable log for a provider into the in-memory aggregate.
    /// Called at startup so daily totals survive restarts.
    pub async fn warm_up(&self, provider_id: &str) -> anyhow::Result<()> {
        let since = Self::day_ordinal(agentflow_models::now_millis()) * 86_400_000;
        let records = self
            .store
            .query_usage_since(provider_id.to_string(), since)
            .await?;

        let mut daily = self.daily.lock();
        for record in records {
            let key = (record.provider_id.clone(), Self::day_ordinal(record.timestamp));
            let totals = daily.entry(key).or_default();
            totals.cost_usd += record.cost_usd.unwrap_or(0.0);
            totals.requests += record.request_count;
        }
        Ok(())
    }
}

#[async_trait]
impl UsageSink for CostTracker {
    async fn record_usage(&self, record: UsageRecord) -> anyhow::Result<()> {
        {
            let mut daily = self.daily.lock();
            let key = (record.provider_id.clone(), Self::day_ordinal(record.timestamp));
            let totals = daily.entry(key).or_default();
            totals.cost_usd += record.cost_usd.unwrap_or(0.0);
            totals.requests += record.request_count;
        }
        self.store.append_usage(record).await
    }

    async fn daily_cost_usd(&self) -> anyhow::Result<f64> {
        Ok(self.daily_cost())
    }
}
