//! Append-only usage record storage.
//!
//! Keys are "{provider_id}:{timestamp_millis:020}:{record_id}" so a query
//! bounded by `timestamp >= since` is a single range scan per provider.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use agentflow_models::UsageRecord;

use crate::range_utils::prefix_end_bound;

const USAGE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("usage_records");

/// Append-only usage log over the shared redb database.
#[derive(Clone)]
pub struct UsageStorage {
    db: Arc<Database>,
}

impl UsageStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(USAGE_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append one record. Existing records are never mutated.
    pub fn append(&self, record: &UsageRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        let key = format!(
            "{}:{:020}:{}",
            record.provider_id, record.timestamp, record.id
        );
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USAGE_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Records for `provider_id` with `timestamp >= since`, ascending.
    pub fn query_since(&self, provider_id: &str, since: i64) -> Result<Vec<UsageRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USAGE_TABLE)?;

        let start = format!("{}:{:020}", provider_id, since.max(0));
        let end = prefix_end_bound(&format!("{}:", provider_id));

        let mut records = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(value.value())?);
        }
        Ok(records)
    }

    /// All records for a provider, ascending by time.
    pub fn query_all(&self, provider_id: &str) -> Result<Vec<UsageRecord>> {
        self.query_since(provider_id, 0)
    }
}
