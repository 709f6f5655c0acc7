//! Persistence of infrastructure-level failures for admin investigation.
//!
//! Separate from regular thread logs: these rows record failures such as a
//! checkpoint flush that could not reach the slow tier, and stay open until
//! an admin resolves them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::errors::Result;

#[derive(Debug, Clone, Serialize)]
pub struct SystemErrorRow {
    pub id: String,
    pub error_type: String,
    pub severity: String,
    pub thread_id: Option<String>,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub error_context: Option<Value>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct SystemErrorStore {
    pool: SqlitePool,
}

impl SystemErrorStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.setup().await?;
        Ok(store)
    }

    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_errors (
                id TEXT PRIMARY KEY,
                error_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                thread_id TEXT,
                error_message TEXT NOT NULL,
                stack_trace TEXT,
                error_context TEXT,
                resolved_by TEXT,
                resolution_notes TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record(
        &self,
        error_type: &str,
        severity: &str,
        thread_id: Option<&str>,
        error_message: &str,
        error_context: Option<&Value>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO system_errors
                (id, error_type, severity, thread_id, error_message, error_context, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(error_type)
        .bind(severity)
        .bind(thread_id)
        .bind(error_message)
        .bind(error_context.map(Value::to_string))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        tracing::error!(error_type, severity, thread_id = ?thread_id, "recorded system error");
        Ok(id)
    }

    /// Unresolved errors in reverse chronological order (all errors when
    /// `include_resolved`).
    pub async fn list(&self, include_resolved: bool, limit: i64) -> Result<Vec<SystemErrorRow>> {
        let query = if include_resolved {
            "SELECT * FROM system_errors ORDER BY created_at DESC LIMIT ?"
        } else {
            "SELECT * FROM system_errors WHERE resolved_by IS NULL ORDER BY created_at DESC LIMIT ?"
        };
        let rows = sqlx::query(query).bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_error).collect())
    }

    pub async fn resolve(&self, id: &str, resolved_by: &str, notes: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE system_errors SET resolved_by = ?, resolution_notes = ? WHERE id = ? AND resolved_by IS NULL",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_error(row: sqlx::sqlite::SqliteRow) -> SystemErrorRow {
    let created_at: String = row.get("created_at");
    let context: Option<String> = row.get("error_context");
    SystemErrorRow {
        id: row.get("id"),
        error_type: row.get("error_type"),
        severity: row.get("severity"),
        thread_id: row.get("thread_id"),
        error_message: row.get("error_message"),
        stack_trace: row.get("stack_trace"),
        error_context: context.and_then(|raw| serde_json::from_str(&raw).ok()),
        resolved_by: row.get("resolved_by"),
        resolution_notes: row.get("resolution_notes"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}
