//! Run metadata persistence: one row per attempted run, outliving run state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use skillflow_core::RunStatus;
use sqlx::{Row, SqlitePool};

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub thread_id: String,
    pub run_name: String,
    pub sop: String,
    pub initial_data: Map<String, Value>,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub llm_model: Option<String>,
    pub parent_thread_id: Option<String>,
    pub rerun_count: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub failed_skill: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form metadata; `callback_url` lives here.
    pub metadata: Map<String, Value>,
}

impl RunMetadata {
    pub fn callback_url(&self) -> Option<&str> {
        self.metadata.get("callback_url").and_then(Value::as_str)
    }
}

pub struct RunMetadataStore {
    pool: Option<SqlitePool>,
}

impl RunMetadataStore {
    pub async fn new(pool: Option<SqlitePool>) -> Result<Self, sqlx::Error> {
        let store = Self { pool };
        if let Some(pool) = &store.pool {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS run_metadata (
                    thread_id TEXT PRIMARY KEY,
                    run_name TEXT,
                    sop TEXT NOT NULL,
                    initial_data TEXT NOT NULL DEFAULT '{}',
                    user_id TEXT,
                    workspace_id TEXT,
                    llm_model TEXT,
                    parent_thread_id TEXT,
                    rerun_count INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'running',
                    error_message TEXT,
                    failed_skill TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}'
                )
                "#,
            )
            .execute(pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_run_metadata_user ON run_metadata(user_id, workspace_id, created_at)",
            )
            .execute(pool)
            .await?;
        }
        Ok(store)
    }

    /// Record a run attempt before anything is validated, so every attempt is
    /// visible. Re-saving the same thread updates the mutable fields.
    #[allow(clippy::too_many_arguments)]
    pub async fn save(
        &self,
        thread_id: &str,
        sop: &str,
        initial_data: &Map<String, Value>,
        run_name: &str,
        user_id: Option<&str>,
        workspace_id: Option<&str>,
        llm_model: Option<&str>,
        callback_url: Option<&str>,
        parent_thread_id: Option<&str>,
        rerun_count: i64,
    ) -> Result<(), ApiError> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let metadata = match callback_url {
            Some(url) => json!({"callback_url": url}),
            None => json!({}),
        };
        sqlx::query(
            r#"
            INSERT INTO run_metadata
                (thread_id, run_name, sop, initial_data, user_id, workspace_id, llm_model,
                 parent_thread_id, rerun_count, status, created_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'running', ?, ?)
            ON CONFLICT (thread_id) DO UPDATE SET
                run_name = excluded.run_name,
                sop = excluded.sop,
                initial_data = excluded.initial_data,
                llm_model = excluded.llm_model,
                metadata = excluded.metadata
            "#,
        )
        .bind(thread_id)
        .bind(run_name)
        .bind(sop)
        .bind(Value::Object(initial_data.clone()).to_string())
        .bind(user_id)
        .bind(workspace_id)
        .bind(llm_model)
        .bind(parent_thread_id)
        .bind(rerun_count)
        .bind(Utc::now().to_rfc3339())
        .bind(metadata.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        thread_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
        failed_skill: Option<&str>,
    ) -> Result<(), ApiError> {
        let Some(pool) = &self.pool else { return Ok(()) };
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        sqlx::query(
            r#"
            UPDATE run_metadata
            SET status = ?, error_message = ?, failed_skill = ?,
                completed_at = COALESCE(?, completed_at)
            WHERE thread_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(failed_skill)
        .bind(completed_at)
        .bind(thread_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, thread_id: &str) -> Result<Option<RunMetadata>, ApiError> {
        let Some(pool) = &self.pool else { return Ok(None) };
        let row = sqlx::query("SELECT * FROM run_metadata WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(row_to_metadata))
    }

    /// Runs visible to a caller, newest first. Admins see the whole
    /// workspace; users see their own runs.
    pub async fn list(
        &self,
        user_id: &str,
        is_admin: bool,
        workspace_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RunMetadata>, ApiError> {
        let Some(pool) = &self.pool else { return Ok(Vec::new()) };
        let rows = if is_admin {
            sqlx::query(
                r#"
                SELECT * FROM run_metadata
                WHERE (?1 IS NULL OR workspace_id = ?1)
                ORDER BY created_at DESC
                LIMIT ?2
                "#,
            )
            .bind(workspace_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT * FROM run_metadata
                WHERE user_id = ?1 AND (?2 IS NULL OR workspace_id = ?2)
                ORDER BY created_at DESC
                LIMIT ?3
                "#,
            )
            .bind(user_id)
            .bind(workspace_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        };
        Ok(rows.into_iter().map(row_to_metadata).collect())
    }
}

fn row_to_metadata(row: sqlx::sqlite::SqliteRow) -> RunMetadata {
    let initial_data: String = row.get("initial_data");
    let metadata: String = row.get("metadata");
    let created_at: String = row.get("created_at");
    let completed_at: Option<String> = row.get("completed_at");
    let thread_id: String = row.get("thread_id");
    let run_name: Option<String> = row.get("run_name");
    RunMetadata {
        run_name: run_name.unwrap_or_else(|| thread_id.clone()),
        thread_id,
        sop: row.get("sop"),
        initial_data: serde_json::from_str(&initial_data).unwrap_or_default(),
        user_id: row.get("user_id"),
        workspace_id: row.get("workspace_id"),
        llm_model: row.get("llm_model"),
        parent_thread_id: row.get("parent_thread_id"),
        rerun_count: row.get("rerun_count"),
        status: row.get("status"),
        error_message: row.get("error_message"),
        failed_skill: row.get("failed_skill"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).ok()
        }),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    }
}
