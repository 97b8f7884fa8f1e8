use crate::props::{bool_prop, str_prop};
use flowcore::{Message, Node, NodeError, Status};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::sync::Arc;

const STATUS_LIMIT: usize = 32;

/// Logs a property of each message, or the whole message.
///
/// Properties: `complete` (`"payload"` by default, `"true"` for the whole
/// message, otherwise a property expression), `active` (default true) and
/// `tostatus` to mirror the output in the node status.
pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let complete = str_prop(node, "complete").unwrap_or("payload").to_string();
        let active = bool_prop(node, "active").unwrap_or(true);
        let to_status = bool_prop(node, "tostatus").unwrap_or(false);
        let weak = node.handle();

        node.on_input(move |msg, _, _| {
            let result = match weak.upgrade() {
                Some(node) if active => output(&msg, &complete).map(|value| {
                    if to_status {
                        node.status(Status::new("grey", "dot", status_text(&value)));
                    }
                    node.log(value);
                }),
                _ => Ok(()),
            };
            async move { result }
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "debug"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs message properties for debugging".to_string(),
            category: "common".to_string(),
            inputs: 1,
            outputs: 0,
        }
    }
}

fn output(msg: &Message, complete: &str) -> Result<Value, NodeError> {
    if complete == "true" {
        return Ok(msg.clone().into_value());
    }
    Ok(msg.property(complete)?.cloned().unwrap_or(Value::Null))
}

fn status_text(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > STATUS_LIMIT {
        let cut: String = text.chars().take(STATUS_LIMIT).collect();
        format!("{cut}...")
    } else {
        text
    }
}
