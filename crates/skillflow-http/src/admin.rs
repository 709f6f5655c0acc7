//! Admin and diagnostics endpoints: run listings, checkpoint history,
//! persisted logs and the system-errors queue.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::identity::Caller;
use crate::runs::check_run_ownership;
use crate::state::AppState;
use crate::types::ResolveErrorRequest;

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<i64>,
    pub workspace_id: Option<String>,
}

pub async fn list_runs(
    State(app): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    let workspace = app
        .workspaces
        .resolve(&caller.id, query.workspace_id.as_deref())
        .await?;
    let runs = app
        .metadata
        .list(
            &caller.id,
            caller.is_admin,
            workspace.as_ref().map(|ws| ws.id.as_str()),
            query.limit.unwrap_or(50),
        )
        .await?;
    Ok(Json(json!({"runs": runs, "count": runs.len()})))
}

pub async fn run_detail(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    let metadata = check_run_ownership(&app, &thread_id, &caller, None).await?;
    let checkpoints = app
        .engine
        .checkpoints()
        .list(&thread_id, 100)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({
        "run": metadata,
        "checkpoints": checkpoints,
        "checkpoint_count": checkpoints.len(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
    pub workspace_id: Option<String>,
}

pub async fn thread_logs(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<LogsQuery>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    check_run_ownership(&app, &thread_id, &caller, query.workspace_id.as_deref()).await?;
    let logs = app
        .events()
        .thread_logs(&thread_id, query.limit.unwrap_or(1000))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({"thread_id": thread_id, "logs": logs, "count": logs.len()})))
}

#[derive(Debug, Default, Deserialize)]
pub struct SystemErrorsQuery {
    #[serde(default)]
    pub include_resolved: bool,
    pub limit: Option<i64>,
}

pub async fn list_system_errors(
    State(app): State<Arc<AppState>>,
    Query(query): Query<SystemErrorsQuery>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    if !caller.is_admin {
        return Err(ApiError::forbidden("admin access required"));
    }
    let Some(store) = &app.system_errors else {
        return Ok(Json(json!({"errors": [], "count": 0})));
    };
    let errors = store
        .list(query.include_resolved, query.limit.unwrap_or(100))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({"errors": errors, "count": errors.len()})))
}

pub async fn resolve_system_error(
    State(app): State<Arc<AppState>>,
    Path(error_id): Path<String>,
    caller: Caller,
    body: Option<Json<ResolveErrorRequest>>,
) -> Result<Json<Value>, ApiError> {
    if !caller.is_admin {
        return Err(ApiError::forbidden("admin access required"));
    }
    let Some(store) = &app.system_errors else {
        return Err(ApiError::not_found("system error store not configured"));
    };
    let notes = body.and_then(|Json(req)| req.resolution_notes);
    let resolved = store
        .resolve(&error_id, &caller.id, notes.as_deref())
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !resolved {
        return Err(ApiError::not_found("system error not found or already resolved"));
    }
    Ok(Json(json!({"status": "resolved", "id": error_id})))
}
