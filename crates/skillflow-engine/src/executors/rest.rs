//! The REST executor: two-phase, pause-and-resume.
//!
//! Instead of blocking on the remote call, the executor POSTs a work request
//! to the partner and records the skill in `_rest_pending`; the engine then
//! pauses at the `await_callback` interrupt until the partner POSTs back to
//! the public callback endpoint.

use serde_json::{json, Map, Value};
use skillflow_core::{paths::render_template, RunState, Skill};

use crate::context::{EngineContext, ExecutionEnv};
use crate::errors::{EngineError, Result};

/// What the executor node should do after a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestDispatch {
    /// Work was sent; pause at `await_callback`.
    Dispatched,
    /// The skill was already pending; no request was sent.
    Duplicate,
}

fn build_payload(skill: &Skill, inputs: &Map<String, Value>, env: ExecutionEnv<'_>, callback_url: &str) -> Value {
    json!({
        "skill": skill.name,
        "thread_id": env.thread_id,
        "callback_url": callback_url,
        "inputs": inputs,
        "expected_outputs": skill.all_produces().into_iter().collect::<Vec<_>>(),
        "sop": env.sop,
    })
}

async fn send(ctx: &EngineContext, skill: &Skill, inputs: &Map<String, Value>, env: ExecutionEnv<'_>) -> Result<String> {
    let rest = skill
        .rest
        .as_ref()
        .ok_or_else(|| EngineError::Execution(format!("{} is missing REST configuration", skill.name)))?;
    let url = render_template(&rest.url, inputs)?;
    let method = reqwest::Method::from_bytes(rest.method.as_bytes())
        .map_err(|_| EngineError::Execution(format!("{}: invalid REST method '{}'", skill.name, rest.method)))?;
    let payload = build_payload(skill, inputs, env, &ctx.config.callback_url());

    let mut request = ctx
        .http
        .request(method, &url)
        .timeout(std::time::Duration::from_secs_f64(rest.timeout))
        .json(&payload);
    for (key, value) in &rest.headers {
        request = request.header(key, value);
    }
    request.send().await?.error_for_status()?;
    Ok(url)
}

/// Dispatch for the graph's executor node: guards against double-dispatch
/// and marks the skill pending on success.
pub async fn dispatch(
    ctx: &EngineContext,
    skill: &Skill,
    inputs: &Map<String, Value>,
    state: &mut RunState,
    env: ExecutionEnv<'_>,
) -> Result<RestDispatch> {
    if state.rest_pending().contains(&skill.name) {
        ctx.events.info(
            env.thread_id,
            format!(
                "[EXECUTOR] {} already pending REST callback. Skipping duplicate dispatch.",
                skill.name
            ),
        );
        state.push_history(format!("Skipped duplicate REST dispatch for {}", skill.name));
        return Ok(RestDispatch::Duplicate);
    }

    let url = send(ctx, skill, inputs, env).await?;
    ctx.events.info(
        env.thread_id,
        format!("[EXECUTOR] {} dispatched to REST endpoint {url}", skill.name),
    );
    state.mark_rest_pending(&skill.name);
    state.push_history(format!("Requested {} via REST API", skill.name));
    Ok(RestDispatch::Dispatched)
}

/// Dispatch without pending bookkeeping (pipeline-nested REST skills).
pub async fn dispatch_only(
    ctx: &EngineContext,
    skill: &Skill,
    inputs: &Map<String, Value>,
    env: ExecutionEnv<'_>,
) -> Result<()> {
    let url = send(ctx, skill, inputs, env).await?;
    ctx.events.info(env.thread_id, format!("[EXECUTOR] {} dispatched to REST endpoint {url}", skill.name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, StaticChat};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    async fn partner_server(received: Arc<Mutex<Vec<Value>>>) -> String {
        let app = Router::new().route(
            "/task/:order",
            post(move |Json(body): Json<Value>| {
                let received = received.clone();
                async move {
                    received.lock().unwrap_or_else(|e| e.into_inner()).push(body);
                    Json(json!({"status": "accepted"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn rest_skill(url: &str) -> Skill {
        serde_json::from_value(json!({
            "name": "validate",
            "description": "remote validation",
            "requires": ["order_id"],
            "produces": ["approved"],
            "executor": "rest",
            "rest": {"url": format!("{url}/task/{{order_id}}"), "timeout": 5.0}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_posts_payload_and_marks_pending() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let base = partner_server(received.clone()).await;
        let ctx = test_context(StaticChat::silent());
        let skill = rest_skill(&base);
        let mut state = RunState::new("t1", "Validate the order", Map::new());
        let inputs = json!({"order_id": "42"}).as_object().cloned().unwrap();

        let outcome = dispatch(
            &ctx,
            &skill,
            &inputs,
            &mut state,
            ExecutionEnv { sop: "Validate the order", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestDispatch::Dispatched);
        assert!(state.rest_pending().contains("validate"));
        assert!(state.history.iter().any(|h| h == "Requested validate via REST API"));

        let payloads = received.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["skill"], "validate");
        assert_eq!(payloads[0]["thread_id"], "t1");
        assert_eq!(payloads[0]["inputs"]["order_id"], "42");
        assert_eq!(payloads[0]["expected_outputs"], json!(["approved"]));
        assert!(payloads[0]["callback_url"].as_str().unwrap().ends_with("/callback"));
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_is_a_noop() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let base = partner_server(received.clone()).await;
        let ctx = test_context(StaticChat::silent());
        let skill = rest_skill(&base);
        let mut state = RunState::new("t1", "sop", Map::new());
        state.mark_rest_pending("validate");
        let inputs = json!({"order_id": "42"}).as_object().cloned().unwrap();

        let outcome = dispatch(
            &ctx,
            &skill,
            &inputs,
            &mut state,
            ExecutionEnv { sop: "sop", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestDispatch::Duplicate);
        assert!(received.lock().unwrap_or_else(|e| e.into_inner()).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_fails_on_unreachable_partner() {
        let ctx = test_context(StaticChat::silent());
        let skill = rest_skill("http://127.0.0.1:1");
        let mut state = RunState::new("t1", "sop", Map::new());
        let inputs = json!({"order_id": "42"}).as_object().cloned().unwrap();
        let err = dispatch(
            &ctx,
            &skill,
            &inputs,
            &mut state,
            ExecutionEnv { sop: "sop", thread_id: "t1", ..Default::default() },
        )
        .await;
        assert!(err.is_err());
        assert!(state.rest_pending().is_empty());
    }
}
