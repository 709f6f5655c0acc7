//! JSON sanitization for checkpoint payloads.
//!
//! Every payload handed to the cache tier must round-trip through a strict
//! JSON parser: NaN and ±Infinity floats are replaced with null. serde_json
//! values built through [`number`] can never carry non-finite floats; the
//! recursive [`sanitize`] walk normalizes values built elsewhere.

use serde_json::{Number, Value};

/// Convert a float to JSON, mapping non-finite values to null.
pub fn number(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Recursively normalize a JSON tree in place. Any number that does not
/// represent a finite value becomes null.
pub fn sanitize(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if n.as_i64().is_none() && n.as_u64().is_none() && !n.as_f64().map(f64::is_finite).unwrap_or(false)
            {
                *value = Value::Null;
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize(item);
            }
        }
        Value::Object(map) => {
            for (_, val) in map.iter_mut() {
                sanitize(val);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_finite_floats_become_null() {
        assert_eq!(number(f64::NAN), Value::Null);
        assert_eq!(number(f64::INFINITY), Value::Null);
        assert_eq!(number(f64::NEG_INFINITY), Value::Null);
        assert_eq!(number(2.5), json!(2.5));
    }

    #[test]
    fn test_sanitized_payload_parses_as_strict_json() {
        let mut payload = json!({
            "metrics": {"ratio": number(f64::NAN), "total": 12},
            "series": [number(f64::INFINITY), 1.5, {"inner": number(f64::NEG_INFINITY)}]
        });
        sanitize(&mut payload);
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(!encoded.contains("NaN"));
        assert!(!encoded.contains("Infinity"));
        let reparsed: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reparsed["metrics"]["ratio"], Value::Null);
        assert_eq!(reparsed["series"][0], Value::Null);
        assert_eq!(reparsed["series"][2]["inner"], Value::Null);
    }
}
