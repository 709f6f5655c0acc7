//! REST-executor completion endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use skillflow_core::paths::deep_merge;
use skillflow_core::{RunState, RunStatus};

use crate::error::ApiError;
use crate::runs::finalize_outcome;
use crate::state::AppState;
use crate::types::{CallbackPayload, DemoRestRequest};

/// Partner callback: merges results, clears the pending marker and resumes
/// the graph. Replays are idempotent via the history marker; callbacks for
/// already-terminal runs are merged (partner work is kept) but do not revive
/// the run.
pub async fn rest_callback(
    State(app): State<Arc<AppState>>,
    Json(req): Json<CallbackPayload>,
) -> Result<Json<Value>, ApiError> {
    let mut state = app
        .engine
        .checkpoints()
        .latest_state(&req.thread_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("Unknown thread_id"))?;

    let marker = RunState::callback_marker(&req.skill);
    if state.history.iter().any(|entry| entry == &marker) {
        app.events().info(
            &req.thread_id,
            format!("[CALLBACK] Duplicate callback ignored for thread={}, skill={}", req.thread_id, req.skill),
        );
        return Ok(Json(json!({"status": "duplicate_ignored"})));
    }

    app.events().info(
        &req.thread_id,
        format!("[CALLBACK] Received results for thread={}, skill={}", req.thread_id, req.skill),
    );
    deep_merge(&mut state.data_store, &req.data);
    state.clear_rest_pending(&req.skill);
    state.push_history(marker);
    if let Some(error) = &req.error {
        state.push_history(format!("Error from {}: {error}", req.skill));
    }
    state.pending_interrupt = None;
    app.engine
        .checkpoints()
        .put(&state, json!({"source": "callback"}))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    // Cancelled (or otherwise finished) runs keep the merged data but stay
    // terminal.
    if let Some(metadata) = app.metadata.get(&req.thread_id).await? {
        if metadata.status.parse::<RunStatus>().map(|s| s.is_terminal()).unwrap_or(false) {
            app.events().info(
                &req.thread_id,
                format!("[CALLBACK] Results stored for terminal run (status={})", metadata.status),
            );
            return Ok(Json(json!({"status": "accepted"})));
        }
    }

    app.metadata
        .update_status(&req.thread_id, RunStatus::Running, None, None)
        .await?;
    let thread_id = req.thread_id.clone();
    let outcome = app.engine.run(state, None).await;
    finalize_outcome(&app, &thread_id, &outcome).await;
    app.events()
        .info(&thread_id, format!("[CALLBACK] Applied results and resumed thread={thread_id}"));
    Ok(Json(json!({"status": "resumed"})))
}

/// Simulated long-running partner API: acknowledges immediately, then POSTs
/// mock results back to the provided callback URL after a delay.
pub async fn demo_rest_task(
    State(app): State<Arc<AppState>>,
    Json(req): Json<DemoRestRequest>,
) -> Json<Value> {
    app.events().info(
        &req.thread_id,
        format!("[DEMO REST] Received request for skill={}, thread={}", req.skill, req.thread_id),
    );
    let http = app.ctx().http.clone();
    let events = app.events().clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        let payload = json!({
            "thread_id": req.thread_id,
            "skill": req.skill,
            "data": {
                "mock_result": "completed by demo endpoint",
                "echoed_inputs": req.inputs,
                "sop_seen": req.sop,
            },
        });
        events.info(&req.thread_id, format!("[DEMO REST] Sending callback for thread={}", req.thread_id));
        match http.post(&req.callback_url).json(&payload).send().await {
            Ok(_) => events.info(&req.thread_id, format!("[DEMO REST] Callback completed for thread={}", req.thread_id)),
            Err(err) => events.warn(&req.thread_id, format!("[DEMO REST] Callback failed for thread={}: {err}", req.thread_id)),
        }
    });
    Json(json!({"status": "accepted", "will_callback_in": "10s"}))
}
