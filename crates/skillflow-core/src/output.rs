//! Output mapping: pipeline step output specs and the shared
//! produces-mapping rules every executor honors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::skill::Skill;

/// Where a pipeline step stores its produced value.
///
/// A single key stores the value as-is. A list of keys maps either by key
/// (produced dicts) or positionally (produced sequences of matching length).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    Key(String),
    Keys(Vec<String>),
}

/// Map a produced value into one or more output keys.
pub fn apply_output_spec(
    spec: Option<&OutputSpec>,
    value: Value,
    error_prefix: &str,
) -> Result<Map<String, Value>, CoreError> {
    let mut out = Map::new();
    match spec {
        None => {
            out.insert("result".to_string(), value);
        }
        Some(OutputSpec::Key(key)) => {
            out.insert(key.clone(), value);
        }
        Some(OutputSpec::Keys(keys)) if keys.len() == 1 => {
            out.insert(keys[0].clone(), value);
        }
        Some(OutputSpec::Keys(keys)) => match value {
            Value::Object(mut map) => {
                let missing: Vec<&String> = keys.iter().filter(|k| !map.contains_key(*k)).collect();
                if !missing.is_empty() {
                    return Err(CoreError::OutputSpec(format!(
                        "{error_prefix}: output keys {missing:?} not present in produced dict"
                    )));
                }
                for key in keys {
                    if let Some(val) = map.remove(key) {
                        out.insert(key.clone(), val);
                    }
                }
            }
            Value::Array(items) => {
                if items.len() != keys.len() {
                    return Err(CoreError::OutputSpec(format!(
                        "{error_prefix}: output key count ({}) does not match produced sequence length ({})",
                        keys.len(),
                        items.len()
                    )));
                }
                for (key, val) in keys.iter().zip(items) {
                    out.insert(key.clone(), val);
                }
            }
            other => {
                return Err(CoreError::OutputSpec(format!(
                    "{error_prefix}: output is a list but produced value is {}; expected dict or sequence",
                    type_name(&other)
                )))
            }
        },
    }
    Ok(out)
}

fn type_name(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Map an executor result onto the skill's declared outputs.
///
/// Every declared `produces` key must be present in the result; all missing
/// keys are listed in the error. Extra keys are ignored with a warning, never
/// merged under a different name. `optional_produces` keys are copied through
/// when present and silently skipped otherwise.
pub fn map_produces(skill: &Skill, mut result: Map<String, Value>) -> Result<Map<String, Value>, CoreError> {
    if skill.produces.is_empty() && skill.optional_produces.is_empty() {
        return Ok(result);
    }

    let mut mapped = Map::new();
    let mut missing: Vec<&str> = Vec::new();
    for key in &skill.produces {
        match result.remove(key) {
            Some(val) => {
                mapped.insert(key.clone(), val);
            }
            None => {
                tracing::warn!(
                    skill = %skill.name,
                    key = %key,
                    "skill declares a produces key the executor did not return"
                );
                missing.push(key);
            }
        }
    }
    if !missing.is_empty() {
        return Err(CoreError::MissingOutputs { missing: missing.join(", ") });
    }
    for key in &skill.optional_produces {
        if let Some(val) = result.remove(key) {
            mapped.insert(key.clone(), val);
        }
    }
    for extra in result.keys() {
        tracing::warn!(skill = %skill.name, key = %extra, "extra result key not in produces; ignored");
    }
    Ok(mapped)
}
