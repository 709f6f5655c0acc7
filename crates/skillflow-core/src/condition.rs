//! Conditional predicates for pipeline steps (`run_if` / `skip_if`).
//!
//! Twelve operators over dot-notation fields of the pipeline context.
//! Malformed or unknown predicates never block a pipeline: the step runs
//! (default-open) and a warning is logged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::paths::get_path_value;
use crate::skill::PipelineStep;

/// The operators a predicate may use.
pub const KNOWN_OPERATORS: &[&str] = &[
    "equals",
    "not_equals",
    "contains",
    "not_contains",
    "in",
    "not_in",
    "gt",
    "gte",
    "lt",
    "lte",
    "is_empty",
    "is_not_empty",
];

/// A predicate over the pipeline context. Fields are optional so malformed
/// definitions can be detected (and defaulted open) instead of failing to
/// deserialize.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

fn to_f64(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lower(val: &Value) -> String {
    match val {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (to_f64(a), to_f64(b)) {
        if a.is_number() && b.is_number() {
            return x == y;
        }
    }
    a == b
}

/// ANY-match containment, case-insensitive, over strings and arrays.
fn contains(actual: &Value, expected: &Value) -> bool {
    let needles: Vec<String> = match expected {
        Value::Array(items) => items.iter().map(lower).collect(),
        other => vec![lower(other)],
    };
    match actual {
        Value::String(s) => {
            let haystack = s.to_lowercase();
            needles.iter().any(|n| haystack.contains(n))
        }
        Value::Array(items) => {
            let haystack: Vec<String> = items.iter().map(lower).collect();
            needles.iter().any(|n| haystack.contains(n))
        }
        _ => false,
    }
}

fn is_empty(val: &Value) -> bool {
    match val {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Evaluate one operator. Unknown operators and type mismatches evaluate to
/// `false`; this function never panics.
pub fn evaluate_condition(actual: &Value, operator: &str, expected: &Value) -> bool {
    match operator {
        "equals" => values_equal(actual, expected),
        "not_equals" => !values_equal(actual, expected),
        "contains" => contains(actual, expected),
        "not_contains" => !contains(actual, expected),
        "in" => match expected {
            Value::Array(items) => items.iter().any(|item| values_equal(actual, item)),
            _ => false,
        },
        "not_in" => match expected {
            Value::Array(items) => !items.iter().any(|item| values_equal(actual, item)),
            _ => true,
        },
        "gt" => matches!((to_f64(actual), to_f64(expected)), (Some(a), Some(b)) if a > b),
        "gte" => matches!((to_f64(actual), to_f64(expected)), (Some(a), Some(b)) if a >= b),
        "lt" => matches!((to_f64(actual), to_f64(expected)), (Some(a), Some(b)) if a < b),
        "lte" => matches!((to_f64(actual), to_f64(expected)), (Some(a), Some(b)) if a <= b),
        "is_empty" => is_empty(actual),
        "is_not_empty" => !is_empty(actual),
        _ => false,
    }
}

fn predicate_parts<'a>(pred: &'a Predicate, which: &str, step_name: &str) -> Option<(&'a str, &'a str)> {
    match (pred.field.as_deref(), pred.operator.as_deref()) {
        (Some(field), Some(op)) if KNOWN_OPERATORS.contains(&op) => Some((field, op)),
        _ => {
            tracing::warn!(
                step = %step_name,
                condition = %which,
                "malformed or unknown condition; step will run"
            );
            None
        }
    }
}

/// Decide whether a step should run given its `run_if` / `skip_if`
/// predicates. Returns `true` when the step should execute.
pub fn check_step_condition(step: &PipelineStep, context: &Map<String, Value>) -> bool {
    let step_name = step.name.as_deref().unwrap_or("step");
    let ctx = Value::Object(context.clone());
    if let Some(pred) = &step.run_if {
        if let Some((field, op)) = predicate_parts(pred, "run_if", step_name) {
            let actual = get_path_value(&ctx, field).cloned().unwrap_or(Value::Null);
            if !evaluate_condition(&actual, op, &pred.value) {
                return false;
            }
        }
    }
    if let Some(pred) = &step.skip_if {
        if let Some((field, op)) = predicate_parts(pred, "skip_if", step_name) {
            let actual = get_path_value(&ctx, field).cloned().unwrap_or(Value::Null);
            if evaluate_condition(&actual, op, &pred.value) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::StepKind;
    use serde_json::json;

    fn eval(actual: Value, op: &str, expected: Value) -> bool {
        evaluate_condition(&actual, op, &expected)
    }

    #[test]
    fn test_equals_and_not_equals() {
        assert!(eval(json!("active"), "equals", json!("active")));
        assert!(!eval(json!("active"), "equals", json!("inactive")));
        assert!(eval(json!(42), "equals", json!(42)));
        assert!(eval(json!(42.0), "equals", json!(42)));
        assert!(eval(json!(true), "equals", json!(true)));
        assert!(eval(json!("active"), "not_equals", json!("deleted")));
        assert!(!eval(json!("active"), "not_equals", json!("active")));
    }

    #[test]
    fn test_contains_string_case_insensitive() {
        assert!(eval(json!("Operation successful"), "contains", json!("success")));
        assert!(!eval(json!("Operation failed"), "contains", json!("success")));
        assert!(eval(json!("Operation SUCCESSFUL"), "contains", json!("success")));
        assert!(eval(json!("OPERATION successful"), "contains", json!("SUCCESS")));
    }

    #[test]
    fn test_contains_arrays_any_match() {
        assert!(eval(json!(["Admin", "User"]), "contains", json!("admin")));
        assert!(!eval(json!(["admin", "user"]), "contains", json!("owner")));
        assert!(eval(json!("Currently PROCESSING"), "contains", json!(["pending", "processing"])));
        assert!(!eval(json!("Completed"), "contains", json!(["error", "failed"])));
        assert!(eval(json!(["READ", "Admin"]), "contains", json!(["admin", "owner"])));
        assert!(!eval(json!(["Read", "WRITE"]), "contains", json!(["ADMIN", "owner"])));
    }

    #[test]
    fn test_not_contains() {
        assert!(eval(json!("Success"), "not_contains", json!("error")));
        assert!(!eval(json!("An ERROR occurred"), "not_contains", json!("error")));
        assert!(eval(json!(["User", "Guest"]), "not_contains", json!("ADMIN")));
        assert!(!eval(json!("FAILED operation"), "not_contains", json!(["error", "failed"])));
        assert!(eval(json!(["read", "write"]), "not_contains", json!(["admin", "owner"])));
    }

    #[test]
    fn test_in_and_not_in() {
        assert!(eval(json!("admin"), "in", json!(["admin", "owner", "user"])));
        assert!(!eval(json!("guest"), "in", json!(["admin", "owner", "user"])));
        assert!(!eval(json!("admin"), "in", json!("not_an_array")));
        assert!(eval(json!("guest"), "not_in", json!(["deleted", "banned"])));
        assert!(!eval(json!("deleted"), "not_in", json!(["deleted", "banned"])));
        assert!(eval(json!("admin"), "not_in", json!("not_an_array")));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval(json!(100), "gt", json!(50)));
        assert!(!eval(json!(50), "gt", json!(50)));
        assert!(eval(json!(50), "gte", json!(50)));
        assert!(eval(json!(50), "lt", json!(100)));
        assert!(eval(json!(50), "lte", json!(50)));
        // string coercion
        assert!(eval(json!("100"), "gt", json!("50")));
        assert!(eval(json!("50.5"), "lt", json!("100.8")));
        // invalid types never compare
        assert!(!eval(json!("not_a_number"), "gt", json!("also_not")));
        assert!(!eval(json!([]), "gt", json!(10)));
    }

    #[test]
    fn test_emptiness() {
        for empty in [json!(null), json!(""), json!([]), json!({}), json!(0), json!(false)] {
            assert!(eval(empty.clone(), "is_empty", json!(null)), "{empty:?}");
            assert!(!eval(empty, "is_not_empty", json!(null)));
        }
        for full in [json!("text"), json!([1, 2]), json!({"k": "v"}), json!(1), json!(true)] {
            assert!(!eval(full.clone(), "is_empty", json!(null)), "{full:?}");
            assert!(eval(full, "is_not_empty", json!(null)));
        }
    }

    #[test]
    fn test_unknown_operator_is_false() {
        assert!(!eval(json!("value"), "unknown_op", json!("test")));
        assert!(!eval(json!(null), "contains", json!("test")));
    }

    fn step_with(run_if: Option<Predicate>, skip_if: Option<Predicate>) -> PipelineStep {
        PipelineStep {
            kind: StepKind::Query,
            name: Some("test_step".into()),
            inputs: vec![],
            output: None,
            source: None,
            query: None,
            collection: None,
            filter: None,
            credential_ref: None,
            db_config_file: None,
            function: None,
            skill: None,
            steps: vec![],
            run_if,
            skip_if,
        }
    }

    fn ctx(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_no_condition_always_runs() {
        assert!(check_step_condition(&step_with(None, None), &ctx(json!({"data": "value"}))));
    }

    #[test]
    fn test_run_if_gates_execution() {
        let step = step_with(
            Some(Predicate {
                field: Some("user.plan".into()),
                operator: Some("equals".into()),
                value: json!("premium"),
            }),
            None,
        );
        assert!(check_step_condition(&step, &ctx(json!({"user": {"plan": "premium"}}))));
        assert!(!check_step_condition(&step, &ctx(json!({"user": {"plan": "free"}}))));
    }

    #[test]
    fn test_skip_if_inverts() {
        let step = step_with(
            None,
            Some(Predicate {
                field: Some("data".into()),
                operator: Some("is_empty".into()),
                value: Value::Null,
            }),
        );
        assert!(!check_step_condition(&step, &ctx(json!({"data": []}))));
        assert!(check_step_condition(&step, &ctx(json!({"data": [1, 2, 3]}))));
    }

    #[test]
    fn test_malformed_predicates_default_open() {
        let missing_operator = step_with(
            Some(Predicate { field: Some("user.plan".into()), operator: None, value: Value::Null }),
            None,
        );
        assert!(check_step_condition(&missing_operator, &ctx(json!({"user": {"plan": "x"}}))));

        let missing_field = step_with(
            None,
            Some(Predicate { field: None, operator: Some("equals".into()), value: Value::Null }),
        );
        assert!(check_step_condition(&missing_field, &ctx(json!({"data": "value"}))));

        let unknown_op = step_with(
            Some(Predicate {
                field: Some("data".into()),
                operator: Some("wobbles".into()),
                value: json!(1),
            }),
            None,
        );
        assert!(check_step_condition(&unknown_op, &ctx(json!({"data": "value"}))));
    }
}
