use crate::props::{bool_prop, str_prop};
use flowcore::{Message, Node, NodeError};
use flowruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonAction {
    /// Strings are parsed, everything else is stringified.
    Toggle,
    ToString,
    ToObject,
}

/// Converts a message property between a JSON string and its value.
///
/// Properties: `property` (default `payload`), `action` (empty to toggle,
/// `str` or `obj`) and `pretty`. A missing property passes through
/// untouched; a string that does not parse is reported as an error and the
/// message is not sent.
pub struct JsonNodeFactory;

impl NodeFactory for JsonNodeFactory {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let property = str_prop(node, "property").unwrap_or("payload").to_string();
        let action = match str_prop(node, "action") {
            None => JsonAction::Toggle,
            Some("str") => JsonAction::ToString,
            Some("obj") => JsonAction::ToObject,
            Some(other) => return Err(NodeError::config(format!("Unknown json action: {other}"))),
        };
        let pretty = bool_prop(node, "pretty").unwrap_or(false);

        node.on_input(move |mut msg, send, _| {
            let result = convert(&mut msg, &property, action, pretty).map(|()| send.send(msg));
            async move { result }
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "json"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Converts between a JSON string and its object form".to_string(),
            category: "parser".to_string(),
            inputs: 1,
            outputs: 1,
        }
    }
}

fn convert(msg: &mut Message, property: &str, action: JsonAction, pretty: bool) -> Result<(), NodeError> {
    let Some(value) = msg.property(property)?.cloned() else {
        return Ok(());
    };
    let converted = match (value, action) {
        (Value::String(_), JsonAction::ToString) => return Ok(()),
        (Value::String(text), _) => serde_json::from_str(&text)
            .map_err(|e| NodeError::InvalidMessage(format!("JSON parse error: {e}")))?,
        (_, JsonAction::ToObject) => return Ok(()),
        (other, _) => {
            let text = if pretty {
                serde_json::to_string_pretty(&other)
            } else {
                serde_json::to_string(&other)
            };
            Value::String(text.map_err(|e| NodeError::InvalidMessage(format!("JSON stringify error: {e}")))?)
        }
    };
    msg.set_property(property, Some(converted))?;
    Ok(())
}
