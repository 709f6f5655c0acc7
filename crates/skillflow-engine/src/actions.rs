//! Registry of compiled inline code.
//!
//! Skills authored in the UI carry their action code as source text. At load
//! time the registry compiles each function into a Rhai AST held in a
//! process-local map keyed `{module}.{function}`. There is no module graph
//! and no importing from user code into engine code; a compile failure leaves
//! a diagnostic (with line and column when available) attached to the skill,
//! which stays visible and editable but fails at execution time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::{Map, Number, Value};

use crate::errors::{EngineError, Result};

struct CompiledFunction {
    ast: AST,
    entry: String,
    params: Vec<String>,
}

/// Process-local registry of callable inline functions.
pub struct ActionRegistry {
    engine: Engine,
    functions: RwLock<HashMap<String, Arc<CompiledFunction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        // User code computes over data it was handed; no I/O surface.
        engine.set_max_operations(5_000_000);
        engine.set_max_call_levels(64);
        Self { engine, functions: RwLock::new(HashMap::new()) }
    }

    fn compile(&self, code: &str, origin: &str) -> Result<AST> {
        self.engine.compile(code).map_err(|err| {
            let rhai::ParseError(kind, pos) = err;
            if let (Some(line), Some(col)) = (pos.line(), pos.position()) {
                EngineError::InlineCode(format!("{origin}: {kind} at line {line}, column {col}"))
            } else {
                EngineError::InlineCode(format!("{origin}: {kind}"))
            }
        })
    }

    /// Compile `code` and register the named function under
    /// `{module}.{function}`.
    pub fn register_inline_code(&self, module: &str, function: &str, code: &str) -> Result<()> {
        let ast = self.compile(code, &format!("inline action {module}.{function}"))?;
        let meta = ast
            .iter_functions()
            .find(|f| f.name == function)
            .ok_or_else(|| {
                EngineError::InlineCode(format!(
                    "inline action {module}: function '{function}' not defined in source"
                ))
            })?;
        let params = meta.params.iter().map(|p| p.to_string()).collect();
        let key = format!("{module}.{function}");
        let compiled = Arc::new(CompiledFunction { ast: ast.clone(), entry: function.to_string(), params });
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), compiled);
        tracing::debug!(key = %key, "registered inline action function");
        Ok(())
    }

    /// Compile helper source and register every top-level function under
    /// `{module}.{name}`. Pipeline `transform` steps resolve them by bare
    /// name as a fallback.
    pub fn register_pipeline_helpers(&self, module: &str, code: &str) -> Result<usize> {
        let ast = self.compile(code, &format!("pipeline helpers {module}"))?;
        let mut count = 0usize;
        let mut map = self.functions.write().unwrap_or_else(|e| e.into_inner());
        for meta in ast.iter_functions() {
            let key = format!("{module}.{}", meta.name);
            let compiled = Arc::new(CompiledFunction {
                ast: ast.clone(),
                entry: meta.name.to_string(),
                params: meta.params.iter().map(|p| p.to_string()).collect(),
            });
            map.insert(key, compiled);
            count += 1;
        }
        tracing::debug!(module = %module, count, "registered pipeline helper functions");
        Ok(count)
    }

    fn resolve(&self, name: &str) -> Option<(String, Arc<CompiledFunction>)> {
        let map = self.functions.read().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = map.get(name) {
            return Some((name.to_string(), f.clone()));
        }
        // Bare-name fallback for transform steps.
        let suffix = format!(".{name}");
        map.iter()
            .find(|(key, _)| key.ends_with(&suffix))
            .map(|(key, f)| (key.clone(), f.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Invoke a registered function with the provided named inputs.
    ///
    /// Declared parameters are validated against the provided keys before the
    /// call; mismatches produce a diagnostic listing both sides. The function
    /// must return a map.
    pub async fn call(&self, name: &str, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
        let (key, func) = self
            .resolve(name)
            .ok_or_else(|| EngineError::InlineCode(format!("function '{name}' not found in registry")))?;

        let expected: Vec<&String> = func.params.iter().collect();
        let missing: Vec<&str> = expected
            .iter()
            .filter(|p| !inputs.contains_key(p.as_str()))
            .map(|p| p.as_str())
            .collect();
        let extra: Vec<&str> = inputs
            .keys()
            .filter(|k| !func.params.iter().any(|p| p == *k))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() || !extra.is_empty() {
            let mut msg = format!("Function '{}' signature mismatch.", func.entry);
            if !missing.is_empty() {
                msg.push_str(&format!(" Missing parameters: {{{}}}.", missing.join(", ")));
            }
            if !extra.is_empty() {
                msg.push_str(&format!(" Extra parameters: {{{}}}.", extra.join(", ")));
            }
            msg.push_str(&format!(
                " Expected: {:?}, Provided: {:?}",
                func.params,
                inputs.keys().collect::<Vec<_>>()
            ));
            return Err(EngineError::InlineCode(msg));
        }

        let args: Vec<Dynamic> = func
            .params
            .iter()
            .map(|p| value_to_dynamic(inputs.get(p).unwrap_or(&Value::Null)))
            .collect();

        // Rhai evaluation is CPU-bound; run it off the async executor.
        let engine = new_call_engine();
        let func_for_call = func.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            engine.call_fn::<Dynamic>(&mut scope, &func_for_call.ast, &func_for_call.entry, args)
        })
        .await
        .map_err(|e| EngineError::Execution(format!("inline function task failed: {e}")))?
        .map_err(|e| EngineError::InlineCode(format!("function '{key}' failed: {e}")))?;

        match dynamic_to_value(result) {
            Value::Object(map) => Ok(map),
            other => Err(EngineError::InlineCode(format!(
                "function '{key}' must return a map, got {}",
                json_type(&other)
            ))),
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn new_call_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(5_000_000);
    engine.set_max_call_levels(64);
    engine
}

fn json_type(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// JSON → Rhai conversion.
pub fn value_to_dynamic(val: &Value) -> Dynamic {
    match val {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(items) => {
            let arr: rhai::Array = items.iter().map(value_to_dynamic).collect();
            arr.into()
        }
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (k, v) in map {
                out.insert(k.clone().into(), value_to_dynamic(v));
            }
            out.into()
        }
    }
}

/// Rhai → JSON conversion. Non-finite floats become null so every inline
/// function result round-trips through a strict JSON parser.
pub fn dynamic_to_value(val: Dynamic) -> Value {
    if val.is_unit() {
        return Value::Null;
    }
    if let Some(b) = val.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = val.clone().try_cast::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(f) = val.clone().try_cast::<f64>() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Some(s) = val.clone().try_cast::<String>() {
        return Value::String(s);
    }
    if let Some(arr) = val.clone().try_cast::<rhai::Array>() {
        return Value::Array(arr.into_iter().map(dynamic_to_value).collect());
    }
    if let Some(map) = val.clone().try_cast::<rhai::Map>() {
        let mut out = Map::new();
        for (k, v) in map {
            out.insert(k.to_string(), dynamic_to_value(v));
        }
        return Value::Object(out);
    }
    Value::String(val.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = ActionRegistry::new();
        registry
            .register_inline_code(
                "ws1.sum",
                "add",
                "fn add(x, y) { #{ total: x + y } }",
            )
            .unwrap();
        let out = registry.call("ws1.sum.add", &obj(json!({"x": 2, "y": 3}))).await.unwrap();
        assert_eq!(Value::Object(out), json!({"total": 5}));
    }

    #[tokio::test]
    async fn test_parameter_mismatch_diagnostic() {
        let registry = ActionRegistry::new();
        registry
            .register_inline_code("m", "f", "fn f(a, b) { #{ out: a } }")
            .unwrap();
        let err = registry.call("m.f", &obj(json!({"a": 1, "c": 2}))).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Missing parameters: {b}"), "{msg}");
        assert!(msg.contains("Extra parameters: {c}"), "{msg}");
    }

    #[tokio::test]
    async fn test_non_map_return_is_rejected() {
        let registry = ActionRegistry::new();
        registry.register_inline_code("m", "f", "fn f(a) { a + 1 }").unwrap();
        let err = registry.call("m.f", &obj(json!({"a": 1}))).await.unwrap_err();
        assert!(err.to_string().contains("must return a map"));
    }

    #[test]
    fn test_compile_error_includes_position() {
        let registry = ActionRegistry::new();
        let err = registry
            .register_inline_code("m", "f", "fn f(a) { a +  }")
            .unwrap_err();
        assert!(err.to_string().contains("line"), "{err}");
    }

    #[test]
    fn test_missing_entry_function() {
        let registry = ActionRegistry::new();
        let err = registry
            .register_inline_code("m", "g", "fn f(a) { #{} }")
            .unwrap_err();
        assert!(err.to_string().contains("'g' not defined"));
    }

    #[tokio::test]
    async fn test_pipeline_helpers_and_bare_name_lookup() {
        let registry = ActionRegistry::new();
        let count = registry
            .register_pipeline_helpers(
                "ws1.metrics",
                r#"
fn double(v) { #{ doubled: v * 2 } }
fn label(v) { #{ label: `value=${v}` } }
"#,
            )
            .unwrap();
        assert_eq!(count, 2);
        assert!(registry.contains("ws1.metrics.double"));
        let out = registry.call("double", &obj(json!({"v": 4}))).await.unwrap();
        assert_eq!(Value::Object(out), json!({"doubled": 8}));
    }

    #[test]
    fn test_nan_becomes_null() {
        let val = dynamic_to_value(Dynamic::from(f64::NAN));
        assert_eq!(val, Value::Null);
        let val = dynamic_to_value(Dynamic::from(f64::INFINITY));
        assert_eq!(val, Value::Null);
    }

    #[test]
    fn test_value_roundtrip() {
        let input = json!({"a": [1, 2.5, "x", true, null], "b": {"c": 7}});
        let roundtripped = dynamic_to_value(value_to_dynamic(&input));
        assert_eq!(roundtripped, input);
    }
}
