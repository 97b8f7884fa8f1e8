use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Node log levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Metric,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Metric => "metric",
        };
        f.write_str(name)
    }
}

/// A log line emitted by a node and handed to its flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub msg: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "_alias", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl LogRecord {
    /// Metric records carry `{event, msgid, value}` as their message.
    pub fn metric_event(&self) -> Option<&str> {
        if self.level != LogLevel::Metric {
            return None;
        }
        self.msg.get("event").and_then(Value::as_str)
    }

    pub fn metric_body(event: String, msg_id: Option<&str>, value: Option<Value>) -> Value {
        json!({
            "event": event,
            "msgid": msg_id,
            "value": value,
        })
    }

    /// The message as display text: strings unquoted, anything else as JSON.
    pub fn text(&self) -> String {
        match &self.msg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Metric);
    }

    #[test]
    fn record_shape() {
        let record = LogRecord {
            level: LogLevel::Warn,
            id: "n1".into(),
            node_type: "inject".into(),
            msg: "careful".into(),
            z: Some("f1".into()),
            name: None,
            alias: None,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"level": "warn", "id": "n1", "type": "inject", "msg": "careful", "z": "f1"})
        );
        assert_eq!(record.text(), "careful");
    }
}
