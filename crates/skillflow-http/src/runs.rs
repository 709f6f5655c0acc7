//! Run lifecycle endpoints: start, stop, rerun, status, approve.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use skillflow_core::{Interrupt, RunState, RunStatus};
use skillflow_engine::RunOutcome;
use uuid::Uuid;

use crate::error::ApiError;
use crate::identity::Caller;
use crate::metadata::RunMetadata;
use crate::state::AppState;
use crate::types::{RerunRequest, StartRequest, StatusResponse};
use crate::webhook::spawn_webhook;

#[derive(Debug, Default, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace_id: Option<String>,
}

/// Assert the caller owns the run (admins bypass) and, when a workspace is
/// requested, that the run belongs to it.
pub(crate) async fn check_run_ownership(
    app: &AppState,
    thread_id: &str,
    caller: &Caller,
    workspace_id: Option<&str>,
) -> Result<Option<RunMetadata>, ApiError> {
    let Some(metadata) = app.metadata.get(thread_id).await? else {
        if app.db.is_some() {
            return Err(ApiError::not_found(format!("Run not found: {thread_id}")));
        }
        return Ok(None);
    };
    if !caller.is_admin {
        if metadata.user_id.as_deref() != Some(caller.id.as_str()) {
            return Err(ApiError::forbidden("You do not have access to this run"));
        }
    }
    if let (Some(requested), Some(actual)) = (workspace_id, metadata.workspace_id.as_deref()) {
        if requested != actual {
            return Err(ApiError::not_found(format!("Run not found: {thread_id}")));
        }
    }
    Ok(Some(metadata))
}

/// Record the outcome of a finished engine pass: status transition, terminal
/// flush of checkpoints and events, and the completion webhook.
pub(crate) async fn finalize_outcome(app: &Arc<AppState>, thread_id: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { .. } => {
            let _ = app
                .metadata
                .update_status(thread_id, RunStatus::Completed, None, None)
                .await;
            app.events()
                .info(thread_id, format!("[API] Workflow completed for thread={thread_id}"));
            terminal_flush(app, thread_id).await;
            spawn_webhook(app.clone(), thread_id.to_string());
        }
        RunOutcome::Failed { error, failed_skill, .. } => {
            let _ = app
                .metadata
                .update_status(thread_id, RunStatus::Error, Some(error), failed_skill.as_deref())
                .await;
            app.events()
                .info(thread_id, format!("[API] Workflow failed for thread={thread_id}"));
            terminal_flush(app, thread_id).await;
            spawn_webhook(app.clone(), thread_id.to_string());
        }
        RunOutcome::Paused { interrupt, .. } => {
            let _ = app.metadata.update_status(thread_id, RunStatus::Paused, None, None).await;
            app.events().info(
                thread_id,
                format!("[API] Workflow paused at {} for thread={thread_id}", interrupt.node_name()),
            );
        }
    }
}

async fn terminal_flush(app: &AppState, thread_id: &str) {
    app.events().flush_thread(thread_id).await;
    app.engine.checkpoints().flush_thread(thread_id).await;
}

async fn run_workflow(app: Arc<AppState>, state: RunState, user_id: String) {
    let thread_id = state.thread_id.clone();
    let outcome = app.engine.run(state, Some(&user_id)).await;
    finalize_outcome(&app, &thread_id, &outcome).await;
    app.drop_task(&thread_id);
}

fn spawn_run(app: &Arc<AppState>, state: RunState, user_id: &str) {
    let thread_id = state.thread_id.clone();
    let handle = tokio::spawn(run_workflow(app.clone(), state, user_id.to_string()));
    app.register_task(&thread_id, handle);
}

pub async fn start(
    State(app): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let run_name = req
        .run_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&req.thread_id)
        .to_string();
    let workspace = app.workspaces.resolve(&caller.id, req.workspace_id.as_deref()).await?;
    let workspace_id = workspace.as_ref().map(|ws| ws.id.clone());
    let initial_data = req.initial_data.clone().unwrap_or_default();

    // Metadata first: every attempt is recorded, valid or not.
    app.metadata
        .save(
            &req.thread_id,
            &req.sop,
            &initial_data,
            &run_name,
            Some(&caller.id),
            workspace_id.as_deref(),
            req.llm_model.as_deref(),
            req.callback_url.as_deref(),
            None,
            0,
        )
        .await?;

    if let Some(ack_key) = &req.ack_key {
        app.events().admin(json!({
            "type": "ack",
            "ack_key": ack_key,
            "thread_id": req.thread_id,
            "run_name": run_name,
            "status": "accepted",
        }));
    }

    let llm_model = match app.ctx().models.resolve(req.llm_model.as_deref()) {
        Ok(model) => model,
        Err(err) => {
            let error_msg = format!("Invalid LLM model specified. {err}");
            app.events().info(&req.thread_id, format!("[RUN REJECTED] {error_msg}"));
            app.events().admin(json!({
                "type": "run_rejected",
                "thread_id": req.thread_id,
                "run_name": run_name,
                "error": error_msg,
                "reason": "invalid_model",
            }));
            app.metadata
                .update_status(&req.thread_id, RunStatus::Failed, Some(&error_msg), None)
                .await?;
            return Err(ApiError::bad_request(error_msg));
        }
    };

    // Re-save with the validated model so metadata reflects what actually runs.
    app.metadata
        .save(
            &req.thread_id,
            &req.sop,
            &initial_data,
            &run_name,
            Some(&caller.id),
            workspace_id.as_deref(),
            Some(&llm_model),
            req.callback_url.as_deref(),
            None,
            0,
        )
        .await?;

    let mut state = RunState::new(&req.thread_id, &req.sop, initial_data);
    state.workspace_id = workspace_id.clone();
    state.llm_model = Some(llm_model.clone());
    state.broadcast = req.broadcast;
    if let Err(err) = app.engine.checkpoints().put(&state, json!({"source": "input"})).await {
        return Err(ApiError::internal(format!("failed to seed checkpoint: {err}")));
    }

    app.events().admin(json!({
        "type": "run_started",
        "thread_id": req.thread_id,
        "run_name": run_name,
        "user": caller.id,
    }));
    app.events().info(&req.thread_id, format!("[API] LLM model selected: {llm_model}"));
    app.events().info(
        &req.thread_id,
        format!("[API] Log broadcast mode: {}", if req.broadcast { "enabled" } else { "disabled" }),
    );

    if req.await_response {
        let thread_id = req.thread_id.clone();
        let outcome = app.engine.run(state, Some(&caller.id)).await;
        finalize_outcome(&app, &thread_id, &outcome).await;
        let (status, error) = match &outcome {
            RunOutcome::Completed { .. } => ("completed", None),
            RunOutcome::Failed { error, .. } => ("failed", Some(error.clone())),
            RunOutcome::Paused { .. } => ("paused", None),
        };
        let mut body = json!({
            "status": status,
            "thread_id": thread_id,
            "run_name": run_name,
            "broadcast": req.broadcast,
            "workspace_id": workspace_id,
            "data_store": outcome.data_store(),
        });
        if let Some(error) = error {
            body["error"] = Value::String(error);
        }
        Ok(Json(body))
    } else {
        spawn_run(&app, state, &caller.id);
        Ok(Json(json!({
            "status": "started",
            "thread_id": req.thread_id,
            "run_name": run_name,
            "broadcast": req.broadcast,
            "workspace_id": workspace_id,
        })))
    }
}

pub async fn stop(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    check_run_ownership(&app, &thread_id, &caller, None).await?;

    let handle = app.take_task(&thread_id);
    let Some(handle) = handle.filter(|h| !h.is_finished()) else {
        return Err(ApiError::bad_request("Run is not active"));
    };
    tracing::info!(thread_id = %thread_id, "cancelling workflow task");
    handle.abort();
    // Give the task a moment to unwind cooperatively.
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    app.events().info(&thread_id, "[API] STOP signal sent. Workflow task cancelled.");
    app.metadata
        .update_status(&thread_id, RunStatus::Cancelled, None, None)
        .await?;
    app.events().admin(json!({
        "type": "run_cancelled",
        "thread_id": thread_id,
        "cancelled_by": caller.id,
    }));
    app.events()
        .info(&thread_id, format!("[API] Run {thread_id} cancelled by {}", caller.id));
    terminal_flush(&app, &thread_id).await;
    spawn_webhook(app.clone(), thread_id.clone());

    Ok(Json(json!({
        "status": "cancelled",
        "thread_id": thread_id,
        "message": "Run has been stopped",
    })))
}

pub async fn rerun(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
    caller: Caller,
    body: Option<Json<RerunRequest>>,
) -> Result<Json<Value>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let Some(metadata) = app.metadata.get(&thread_id).await? else {
        return Err(ApiError::not_found("Original run not found"));
    };

    let target_workspace = metadata.workspace_id.clone().or(query.workspace_id);
    let workspace = app.workspaces.resolve(&caller.id, target_workspace.as_deref()).await?;
    let workspace_id = workspace.as_ref().map(|ws| ws.id.clone());
    check_run_ownership(&app, &thread_id, &caller, workspace_id.as_deref()).await?;

    let new_thread_id = format!("thread_{}", Uuid::new_v4());
    let suffix = regex::Regex::new(r"\s*\(Rerun #\d+\)\s*$").unwrap_or_else(|_| unreachable!());
    let base_run_name = suffix.replace(&metadata.run_name, "").trim().to_string();
    let rerun_count = metadata.rerun_count + 1;
    let new_run_name = format!("{base_run_name} (Rerun #{rerun_count})");

    app.metadata
        .save(
            &new_thread_id,
            &metadata.sop,
            &metadata.initial_data,
            &new_run_name,
            Some(&caller.id),
            workspace_id.as_deref(),
            metadata.llm_model.as_deref(),
            req.callback_url.as_deref(),
            Some(&thread_id),
            rerun_count,
        )
        .await?;

    if let Some(ack_key) = &req.ack_key {
        app.events().admin(json!({
            "type": "ack",
            "ack_key": ack_key,
            "thread_id": new_thread_id,
            "run_name": new_run_name,
            "parent_thread_id": thread_id,
            "status": "accepted",
        }));
    }

    let llm_model = match app.ctx().models.resolve(metadata.llm_model.as_deref()) {
        Ok(model) => model,
        Err(err) => {
            let error_msg = format!("Cannot rerun: Original run used model that is no longer valid. {err}");
            app.events().info(&new_thread_id, format!("[RERUN REJECTED] {error_msg}"));
            app.events().admin(json!({
                "type": "run_rejected",
                "thread_id": new_thread_id,
                "run_name": new_run_name,
                "parent_thread_id": thread_id,
                "error": error_msg,
                "reason": "invalid_model",
            }));
            app.metadata
                .update_status(&new_thread_id, RunStatus::Failed, Some(&error_msg), None)
                .await?;
            return Err(ApiError::bad_request(error_msg));
        }
    };

    let mut state = RunState::new(&new_thread_id, &metadata.sop, metadata.initial_data.clone());
    state.history = vec![format!("Process Started (Rerun from {base_run_name})")];
    state.workspace_id = workspace_id;
    state.llm_model = Some(llm_model);
    state.broadcast = req.broadcast;
    app.engine
        .checkpoints()
        .put(&state, json!({"source": "input"}))
        .await
        .map_err(|err| ApiError::internal(format!("failed to seed checkpoint: {err}")))?;

    app.events().admin(json!({
        "type": "run_started",
        "thread_id": new_thread_id,
        "run_name": new_run_name,
        "parent_thread_id": thread_id,
        "user": caller.id,
    }));
    app.events().info(
        &new_thread_id,
        format!("[API] Rerun requested from thread={thread_id} -> new thread={new_thread_id}"),
    );

    spawn_run(&app, state, &caller.id);
    Ok(Json(json!({
        "status": "started",
        "thread_id": new_thread_id,
        "run_name": new_run_name,
        "parent_thread_id": thread_id,
        "rerun_count": rerun_count,
        "broadcast": req.broadcast,
    })))
}

pub async fn status(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
    caller: Caller,
) -> Result<Json<StatusResponse>, ApiError> {
    check_run_ownership(&app, &thread_id, &caller, query.workspace_id.as_deref()).await?;

    let state = app
        .engine
        .checkpoints()
        .latest_state(&thread_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("Unknown thread_id: {thread_id}")))?;

    let is_waiting_callback = state.pending_interrupt == Some(Interrupt::AwaitCallback)
        || !state.rest_pending().is_empty();
    let is_human_review = state.pending_interrupt == Some(Interrupt::HumanReview);
    let next_node = state
        .pending_interrupt
        .map(|i| vec![i.node_name().to_string()])
        .unwrap_or_default();

    Ok(Json(StatusResponse {
        is_paused: !next_node.is_empty(),
        is_human_review,
        is_waiting_callback,
        next_node,
        active_skill: state.active_skill.clone(),
        data: state.data_store.clone(),
        history: state.history.clone(),
        status: state
            .data_store
            .get("_status")
            .and_then(Value::as_str)
            .map(String::from),
        error: state.error().map(String::from),
        failed_skill: state.failed_skill().map(String::from),
    }))
}

pub async fn approve(
    State(app): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
    caller: Caller,
    body: Option<Json<Map<String, Value>>>,
) -> Result<Json<Value>, ApiError> {
    check_run_ownership(&app, &thread_id, &caller, query.workspace_id.as_deref()).await?;
    app.metadata.update_status(&thread_id, RunStatus::Running, None, None).await?;

    let mut state = app
        .engine
        .checkpoints()
        .latest_state(&thread_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("Unknown thread_id: {thread_id}")))?;

    if let Some(Json(updated_data)) = body {
        if !updated_data.is_empty() {
            state.data_store = updated_data;
            app.events()
                .info(&thread_id, format!("[API] Human updated data for thread={thread_id}"));
        }
    }
    state.pending_interrupt = None;
    app.engine
        .checkpoints()
        .put(&state, json!({"source": "approval"}))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    app.events().info(
        &thread_id,
        format!("[API] Human approval received; resuming thread={thread_id} by user={}", caller.id),
    );

    let outcome = app.engine.run(state, Some(&caller.id)).await;
    finalize_outcome(&app, &thread_id, &outcome).await;
    Ok(Json(json!({"status": "resumed"})))
}
