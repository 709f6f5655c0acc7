//! Inline function executor: resolves a compiled callable from the action
//! registry by `{module}.{function}` and invokes it with the input context.

use serde_json::{Map, Value};
use skillflow_core::ActionConfig;

use crate::context::EngineContext;
use crate::errors::{EngineError, Result};

pub async fn execute(
    ctx: &EngineContext,
    action: &ActionConfig,
    inputs: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let function = action
        .function
        .as_deref()
        .ok_or_else(|| EngineError::Execution("function action requires a 'function' field".into()))?;
    let module = action
        .module
        .as_deref()
        .ok_or_else(|| EngineError::Execution("function action requires a 'module' field".into()))?;
    let key = format!("{module}.{function}");
    ctx.actions.call(&key, inputs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, StaticChat};
    use serde_json::json;

    #[tokio::test]
    async fn test_executes_registered_function() {
        let ctx = test_context(StaticChat::silent());
        ctx.actions
            .register_inline_code("fs.calc", "add", "fn add(x, y) { #{ total: x + y } }")
            .unwrap();
        let action: ActionConfig =
            serde_json::from_value(json!({"type": "function", "module": "fs.calc", "function": "add"}))
                .unwrap();
        let inputs = json!({"x": 2, "y": 3}).as_object().cloned().unwrap();
        let out = execute(&ctx, &action, &inputs).await.unwrap();
        assert_eq!(out["total"], json!(5));
    }

    #[tokio::test]
    async fn test_unknown_function_fails() {
        let ctx = test_context(StaticChat::silent());
        let action: ActionConfig =
            serde_json::from_value(json!({"type": "function", "module": "fs.calc", "function": "nope"}))
                .unwrap();
        let err = execute(&ctx, &action, &Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("not found in registry"));
    }
}
