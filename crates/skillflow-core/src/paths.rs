//! Dot-notation path access over JSON trees.
//!
//! Keys like `order.customer.email` or `items.0.id` traverse nested objects
//! and arrays by integer index. Assignment auto-creates intermediate objects;
//! array growth by assignment is not supported (whole arrays are replaced).

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Return the value at a dot-notation path, or `None` when any segment is
/// missing. Numeric segments index into arrays; an empty path yields the
/// root itself.
pub fn get_path_value<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }
    let mut cur = data;
    for part in path.split('.') {
        match cur {
            Value::Object(map) => cur = map.get(part)?,
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                cur = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(cur)
}

/// Set `value` at the dot-notation `path`, creating intermediate objects as
/// needed. Non-object intermediates (including arrays) are overwritten.
pub fn set_path_value(data: &mut Map<String, Value>, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = data;
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            cur.insert((*part).to_string(), value);
            return;
        }
        let entry = cur
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cur = entry.as_object_mut().unwrap_or_else(|| unreachable!());
    }
}

/// Recursively merge `incoming` into `base`. Objects merge deeply; every
/// other type (including arrays) overwrites.
pub fn deep_merge(base: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, val) in incoming {
        match (base.get_mut(key), val) {
            (Some(Value::Object(existing)), Value::Object(new)) => deep_merge(existing, new),
            _ => {
                base.insert(key.clone(), val.clone());
            }
        }
    }
}

/// Whether a value counts as present for planning purposes. Booleans and
/// zeros are valid; null and blank/whitespace strings are not.
pub fn is_present(val: &Value) -> bool {
    match val {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// Collect dot-notation paths for all present values, recursing into nested
/// objects and arrays. Object keys starting with an underscore are internal
/// and skipped at every level.
pub fn available_paths(store: &Map<String, Value>) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    collect_paths(&Value::Object(store.clone()), "", &mut paths);
    paths
}

fn collect_paths(obj: &Value, prefix: &str, paths: &mut BTreeSet<String>) {
    match obj {
        Value::Object(map) => {
            for (key, val) in map {
                if key.starts_with('_') {
                    continue;
                }
                let new_prefix = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if is_present(val) {
                    paths.insert(new_prefix.clone());
                }
                collect_paths(val, &new_prefix, paths);
            }
        }
        Value::Array(items) => {
            for (idx, val) in items.iter().enumerate() {
                let new_prefix = if prefix.is_empty() {
                    idx.to_string()
                } else {
                    format!("{prefix}.{idx}")
                };
                if is_present(val) {
                    paths.insert(new_prefix.clone());
                }
                collect_paths(val, &new_prefix, paths);
            }
        }
        _ => {}
    }
}

/// Render `{dot.path}` placeholders in a template from a context object.
///
/// A missing first segment is an error carrying the list of available keys;
/// deeper missing segments render as empty strings.
pub fn render_template(
    template: &str,
    ctx: &Map<String, Value>,
) -> Result<String, crate::error::CoreError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let path = &after[..end];
        let first = path.split('.').next().unwrap_or(path);
        if !ctx.contains_key(first) {
            let available: Vec<&str> = ctx.keys().map(String::as_str).collect();
            return Err(crate::error::CoreError::MissingPlaceholder {
                placeholder: first.to_string(),
                template: format!("{template} (available: {})", available.join(", ")),
            });
        }
        match get_path_value(&Value::Object(ctx.clone()), path) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
