//! Workspace lookup: the per-user namespace that scopes skills and runs.
//!
//! Workspace CRUD belongs to an external collaborator; the engine only needs
//! to resolve ids, codes (for skill module namespacing) and a user's default
//! workspace.

use sqlx::{Row, SqlitePool};

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct WorkspaceRecord {
    pub id: String,
    pub code: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub is_default: bool,
}

pub struct WorkspaceDirectory {
    pool: Option<SqlitePool>,
}

impl WorkspaceDirectory {
    pub async fn new(pool: Option<SqlitePool>) -> Result<Self> {
        let directory = Self { pool };
        if let Some(pool) = &directory.pool {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS workspaces (
                    id TEXT PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    owner_id TEXT,
                    is_default INTEGER NOT NULL DEFAULT 0
                )
                "#,
            )
            .execute(pool)
            .await?;
        }
        Ok(directory)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkspaceRecord>> {
        let Some(pool) = &self.pool else { return Ok(None) };
        let row = sqlx::query("SELECT id, code, name, owner_id, is_default FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(to_record))
    }

    pub async fn default_for_user(&self, user_id: &str) -> Result<Option<WorkspaceRecord>> {
        let Some(pool) = &self.pool else { return Ok(None) };
        let row = sqlx::query(
            "SELECT id, code, name, owner_id, is_default FROM workspaces WHERE owner_id = ? AND is_default = 1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(to_record))
    }

    /// Resolve the workspace a request targets: the requested id when given,
    /// otherwise the caller's default workspace.
    pub async fn resolve(&self, user_id: &str, requested: Option<&str>) -> Result<Option<WorkspaceRecord>> {
        match requested {
            Some(id) => match self.get(id).await? {
                Some(ws) => Ok(Some(ws)),
                None if self.pool.is_none() => Ok(None),
                None => Err(EngineError::InvalidSkill(format!("workspace not found: {id}"))),
            },
            None => self.default_for_user(user_id).await,
        }
    }

    pub async fn create(
        &self,
        id: &str,
        code: &str,
        name: &str,
        owner_id: Option<&str>,
        is_default: bool,
    ) -> Result<WorkspaceRecord> {
        let Some(pool) = &self.pool else {
            return Err(EngineError::InvalidSkill("workspace store not configured".into()));
        };
        sqlx::query(
            "INSERT INTO workspaces (id, code, name, owner_id, is_default) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(code)
        .bind(name)
        .bind(owner_id)
        .bind(is_default as i32)
        .execute(pool)
        .await?;
        Ok(WorkspaceRecord {
            id: id.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            owner_id: owner_id.map(String::from),
            is_default,
        })
    }
}

fn to_record(row: sqlx::sqlite::SqliteRow) -> WorkspaceRecord {
    WorkspaceRecord {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        owner_id: row.get("owner_id"),
        is_default: row.get::<i32, _>("is_default") != 0,
    }
}
