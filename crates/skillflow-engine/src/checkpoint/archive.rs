//! The slow tier: authoritative relational storage of checkpoints, written
//! as one idempotent batch per thread when a run reaches terminal status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::errors::Result;

/// One checkpoint row: a full state snapshot at a graph transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    pub thread_id: String,
    #[serde(default)]
    pub namespace: String,
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
    /// Serialized run state (sanitized, strict JSON).
    pub state: Value,
    pub metadata: Value,
    /// Position of this checkpoint within its thread's write order.
    pub write_ordinal: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointArchive: Send + Sync {
    /// Insert a batch for one thread in write order, in a single transaction,
    /// idempotent on `(thread_id, namespace, checkpoint_id)`.
    async fn insert_batch(&self, checkpoints: &[StoredCheckpoint]) -> Result<()>;
    /// Checkpoints for a thread in reverse chronological order.
    async fn list(&self, thread_id: &str, limit: i64) -> Result<Vec<StoredCheckpoint>>;
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

/// SQLite-backed archive.
pub struct SqliteCheckpointArchive {
    pool: SqlitePool,
}

impl SqliteCheckpointArchive {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let archive = Self { pool };
        archive.setup().await?;
        Ok(archive)
    }

    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                checkpoint_ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                parent_checkpoint_id TEXT,
                checkpoint TEXT NOT NULL,
                metadata TEXT NOT NULL,
                write_ordinal INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(thread_id, write_ordinal)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointArchive for SqliteCheckpointArchive {
    async fn insert_batch(&self, checkpoints: &[StoredCheckpoint]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for cp in checkpoints {
            sqlx::query(
                r#"
                INSERT INTO checkpoints
                    (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id,
                     checkpoint, metadata, write_ordinal, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id)
                DO UPDATE SET checkpoint = excluded.checkpoint, metadata = excluded.metadata
                "#,
            )
            .bind(&cp.thread_id)
            .bind(&cp.namespace)
            .bind(&cp.checkpoint_id)
            .bind(&cp.parent_checkpoint_id)
            .bind(cp.state.to_string())
            .bind(cp.metadata.to_string())
            .bind(cp.write_ordinal)
            .bind(cp.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, thread_id: &str, limit: i64) -> Result<Vec<StoredCheckpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id,
                   checkpoint, metadata, write_ordinal, created_at
            FROM checkpoints
            WHERE thread_id = ?
            ORDER BY write_ordinal DESC
            LIMIT ?
            "#,
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_checkpoint).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_checkpoint(row: sqlx::sqlite::SqliteRow) -> Result<StoredCheckpoint> {
    let state_raw: String = row.get("checkpoint");
    let metadata_raw: String = row.get("metadata");
    let created_at_raw: String = row.get("created_at");
    Ok(StoredCheckpoint {
        thread_id: row.get("thread_id"),
        namespace: row.get("checkpoint_ns"),
        checkpoint_id: row.get("checkpoint_id"),
        parent_checkpoint_id: row.get("parent_checkpoint_id"),
        state: serde_json::from_str(&state_raw)?,
        metadata: serde_json::from_str(&metadata_raw)?,
        write_ordinal: row.get("write_ordinal"),
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
