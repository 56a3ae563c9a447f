//! Value semantics shared by the evaluator and the executor: truthiness,
//! equality, ordering, text rendering and the dry-run simulation marker.

use std::cmp::Ordering;

use serde_json::Value as JsonValue;

/// Key of the placeholder object produced for outputs that were not computed
/// because the step ran in dry-run mode.
pub const SIMULATED_KEY: &str = "$simulated";

pub fn simulated(step_id: &str) -> JsonValue {
    serde_json::json!({ SIMULATED_KEY: step_id })
}

/// The step id a simulated placeholder stands in for.
pub fn simulated_source(value: &JsonValue) -> Option<&str> {
    match value {
        JsonValue::Object(map) if map.len() == 1 => map.get(SIMULATED_KEY).and_then(|v| v.as_str()),
        _ => None,
    }
}

pub fn is_simulated(value: &JsonValue) -> bool {
    simulated_source(value).is_some()
}

/// Jinja-style truthiness: empty strings, collections and zero are false.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

/// Structural equality where `1` and `1.0` compare equal.
pub fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| json_eq(l, r))
        }
        (JsonValue::Object(x), JsonValue::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).map(|w| json_eq(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Ordering for `<`/`>`: numbers numerically, strings lexicographically, nothing else.
pub fn json_cmp(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// How a value appears when interpolated into a larger string.
pub fn to_text(value: &JsonValue) -> String {
    if let Some(step) = simulated_source(value) {
        return format!("<simulated:{step}>");
    }
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
}
