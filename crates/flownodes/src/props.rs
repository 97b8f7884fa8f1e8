//! Reading node properties as the editor stores them: numbers and booleans
//! often arrive as strings.

use flowcore::{Node, NodeError};
use serde_json::Value;
use std::time::Duration;

pub(crate) fn str_prop<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.property(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub(crate) fn bool_prop(node: &Node, key: &str) -> Option<bool> {
    match node.property(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn f64_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn f64_prop(node: &Node, key: &str) -> Option<f64> {
    node.property(key).and_then(f64_value)
}

/// A non-negative duration of `amount` units.
pub(crate) fn duration(amount: f64, unit_secs: f64, what: &str) -> Result<Duration, NodeError> {
    Duration::try_from_secs_f64(amount * unit_secs)
        .map_err(|_| NodeError::config(format!("Invalid {what}: {amount}")))
}
