//! Script executor: runs an external script with the JSON input context on
//! stdin and expects a JSON object on stdout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use skillflow_core::ActionConfig;
use tokio::io::AsyncWriteExt;

use crate::errors::{EngineError, Result};

pub async fn execute(action: &ActionConfig, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
    let script_path = action
        .script_path
        .as_deref()
        .ok_or_else(|| EngineError::Execution("script action requires a 'script_path' field".into()))?;
    if !Path::new(script_path).exists() {
        return Err(EngineError::Execution(format!("Script not found: {script_path}")));
    }
    let interpreter = action.interpreter.as_deref().unwrap_or("sh");
    let input_json = Value::Object(inputs.clone()).to_string();

    tracing::debug!(script = %script_path, interpreter = %interpreter, "executing script");
    let mut child = tokio::process::Command::new(interpreter)
        .arg(script_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::Execution(format!("Script execution failed: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input_json.as_bytes())
            .await
            .map_err(|e| EngineError::Execution(format!("Script stdin write failed: {e}")))?;
    }

    let output = tokio::time::timeout(Duration::from_secs_f64(action.timeout), child.wait_with_output())
        .await
        .map_err(|_| EngineError::Execution(format!("Script timed out after {} seconds", action.timeout)))?
        .map_err(|e| EngineError::Execution(format!("Script execution failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Execution(format!(
            "Script failed with exit code {}: {stderr}",
            output.status.code().unwrap_or(-1)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
        EngineError::Execution(format!("Script output is not valid JSON: {e}\nOutput: {stdout}"))
    })?;
    match parsed {
        Value::Object(map) => Ok(map),
        other => Err(EngineError::Execution(format!(
            "Script must output a JSON object, got {}",
            match other {
                Value::Array(_) => "array",
                Value::String(_) => "string",
                Value::Number(_) => "number",
                Value::Bool(_) => "bool",
                _ => "null",
            }
        ))),
    }
}
