//! One-shot HTTP call action. Simpler than the REST executor: synchronous
//! request/response, no callback machinery.

use serde_json::{json, Map, Value};
use skillflow_core::paths::render_template;
use skillflow_core::ActionConfig;

use crate::context::EngineContext;
use crate::errors::{EngineError, Result};

pub async fn execute(
    ctx: &EngineContext,
    action: &ActionConfig,
    inputs: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let url_template = action
        .url
        .as_deref()
        .ok_or_else(|| EngineError::Execution("http_call action requires a 'url' field".into()))?;
    let url = render_template(url_template, inputs)?;
    let method_str = action.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = reqwest::Method::from_bytes(method_str.as_bytes())
        .map_err(|_| EngineError::Execution(format!("invalid HTTP method '{method_str}'")))?;
    let send_body = matches!(method_str.as_str(), "POST" | "PUT" | "PATCH");

    tracing::debug!(method = %method_str, url = %url, "http_call");
    let mut request = ctx
        .http
        .request(method, &url)
        .timeout(std::time::Duration::from_secs_f64(action.timeout));
    for (key, value) in &action.headers {
        request = request.header(key, value);
    }
    if send_body {
        request = request.json(&Value::Object(inputs.clone()));
    }

    let response = request
        .send()
        .await
        .map_err(|e| EngineError::Execution(format!("HTTP call failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Execution(format!(
            "HTTP call failed with status {status}"
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    if content_type.contains("application/json") {
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Execution(format!("HTTP call returned invalid JSON: {e}")))?;
        match body {
            Value::Object(map) => Ok(map),
            other => Ok(json!({"response": other}).as_object().cloned().unwrap_or_default()),
        }
    } else {
        let text = response.text().await.unwrap_or_default();
        Ok(json!({"response": text}).as_object().cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, StaticChat};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn server() -> String {
        let app = Router::new()
            .route("/orders/:id", get(|| async { Json(json!({"status": "open", "total": 12.5})) }))
            .route(
                "/submit",
                post(|Json(body): Json<Value>| async move { Json(json!({"echoed": body})) }),
            )
            .route("/plain", get(|| async { "pong" }))
            .route("/missing", get(|| async { (axum::http::StatusCode::NOT_FOUND, "nope") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn action(url: String, method: &str) -> ActionConfig {
        serde_json::from_value(json!({"type": "http_call", "url": url, "method": method})).unwrap()
    }

    #[tokio::test]
    async fn test_get_with_templated_url() {
        let base = server().await;
        let ctx = test_context(StaticChat::silent());
        let inputs = json!({"order_id": 7}).as_object().cloned().unwrap();
        let out = execute(&ctx, &action(format!("{base}/orders/{{order_id}}"), "GET"), &inputs)
            .await
            .unwrap();
        assert_eq!(out["status"], "open");
    }

    #[tokio::test]
    async fn test_post_sends_inputs_as_body() {
        let base = server().await;
        let ctx = test_context(StaticChat::silent());
        let inputs = json!({"a": 1}).as_object().cloned().unwrap();
        let out = execute(&ctx, &action(format!("{base}/submit"), "POST"), &inputs).await.unwrap();
        assert_eq!(out["echoed"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_plain_text_wrapped_under_response() {
        let base = server().await;
        let ctx = test_context(StaticChat::silent());
        let out = execute(&ctx, &action(format!("{base}/plain"), "GET"), &Map::new()).await.unwrap();
        assert_eq!(out["response"], "pong");
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let base = server().await;
        let ctx = test_context(StaticChat::silent());
        let err = execute(&ctx, &action(format!("{base}/missing"), "GET"), &Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
