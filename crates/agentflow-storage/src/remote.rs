//! Remote Postgres state store for distributed deployments.
//!
//! Entities are stored as JSONB documents alongside the columns the core
//! queries on, mirroring the embedded layout: indexed `status` and
//! `session_id` on tasks, `(provider_id, ts)` on usage records,
//! `(task_id, created_at)` on checkpoints.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use agentflow_models::{Checkpoint, Session, Task, TaskStatus, UsageRecord};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        data JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        session_id TEXT REFERENCES sessions(id),
        status TEXT NOT NULL,
        data JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS tasks_status_idx ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS tasks_session_idx ON tasks (session_id)",
    "CREATE TABLE IF NOT EXISTS usage_records (
        id TEXT PRIMARY KEY,
        provider_id TEXT NOT NULL,
        ts BIGINT NOT NULL,
        data JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS usage_provider_ts_idx ON usage_records (provider_id, ts)",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        data JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS checkpoints_task_idx ON checkpoints (task_id, created_at)",
];

/// Async state store backed by a remote Postgres database.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Connect and run the idempotent schema migration.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("failed to connect to remote state store")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn put_session(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_value(session)?;
        sqlx::query(
            "INSERT INTO sessions (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&session.id)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT data FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn put_task(&self, task: &Task) -> Result<()> {
        let data = serde_json::to_value(task)?;
        sqlx::query(
            "INSERT INTO tasks (id, session_id, status, data) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
             SET session_id = EXCLUDED.session_id,
                 status = EXCLUDED.status,
                 data = EXCLUDED.data",
        )
        .bind(&task.id)
        .bind(&task.session_id)
        .bind(task.status.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT data FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT data FROM tasks WHERE status = $1")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    pub async fn list_tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT data FROM tasks WHERE session_id = $1")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    pub async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        let data = serde_json::to_value(record)?;
        sqlx::query(
            "INSERT INTO usage_records (id, provider_id, ts, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.id)
        .bind(&record.provider_id)
        .bind(record.timestamp)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records with `ts >= since`, ascending; uses the composite index.
    pub async fn query_usage_since(
        &self,
        provider_id: &str,
        since: i64,
    ) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT data FROM usage_records
             WHERE provider_id = $1 AND ts >= $2 ORDER BY ts ASC",
        )
        .bind(provider_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    pub async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_value(checkpoint)?;
        sqlx::query(
            "INSERT INTO checkpoints (id, task_id, created_at, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.task_id)
        .bind(checkpoint.created_at)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT data FROM checkpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    pub async fn latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT data FROM checkpoints WHERE task_id = $1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT data FROM checkpoints WHERE task_id = $1 ORDER BY created_at DESC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(serde_json::from_value(data)?)
            })
            .collect()
    }

    pub async fn delete_checkpoint(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cleanup_checkpoints(&self, older_than: i64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
