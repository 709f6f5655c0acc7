//! Terminal-status webhook dispatch.
//!
//! When a run reaches terminal status and its metadata carries a
//! `callback_url`, a minimal JSON envelope is POSTed fire-and-forget.
//! Failures are logged and never affect the run's recorded status.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::state::AppState;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn the webhook invocation without awaiting it.
pub fn spawn_webhook(app: Arc<AppState>, thread_id: String) {
    tokio::spawn(async move {
        invoke_callback(&app, &thread_id).await;
    });
}

pub async fn invoke_callback(app: &AppState, thread_id: &str) {
    let metadata = match app.metadata.get(thread_id).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(thread_id = %thread_id, error = %err.detail, "failed to load metadata for webhook");
            return;
        }
    };
    let Some(callback_url) = metadata.callback_url().map(String::from) else {
        return;
    };

    app.events()
        .info(thread_id, format!("[CALLBACK] Invoking webhook: {callback_url}"));
    let payload = json!({
        "thread_id": metadata.thread_id,
        "status": metadata.status,
        "error_message": metadata.error_message,
        "run_name": metadata.run_name,
        "created_at": metadata.created_at.to_rfc3339(),
        "llm_model": metadata.llm_model,
        "failed_skill": metadata.failed_skill,
        "completed_at": metadata.completed_at.map(|dt| dt.to_rfc3339()),
    });

    let result = app
        .ctx()
        .http
        .post(&callback_url)
        .timeout(WEBHOOK_TIMEOUT)
        .json(&payload)
        .send()
        .await
        .and_then(|response| response.error_for_status());
    match result {
        Ok(response) => {
            app.events().info(
                thread_id,
                format!("[CALLBACK] Webhook invoked successfully (status={})", response.status()),
            );
        }
        Err(err) => {
            app.events()
                .warn(thread_id, format!("[CALLBACK] Error calling webhook: {err}"));
        }
    }
    // The run already flushed its queues at terminal status; persist the
    // webhook lines too instead of leaving them buffered.
    app.events().flush_thread(thread_id).await;
}
