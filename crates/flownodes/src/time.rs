use crate::props::{bool_prop, duration, f64_prop, f64_value, str_prop};
use chrono::Utc;
use flowcore::{Message, Node, NodeError};
use flowruntime::{NodeFactory, NodeMetadata, NODES_STARTED};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

fn unit_secs(unit: &str) -> Option<f64> {
    match unit {
        "milliseconds" => Some(0.001),
        "seconds" => Some(1.0),
        "minutes" => Some(60.0),
        "hours" => Some(3600.0),
        "days" => Some(86400.0),
        _ => None,
    }
}

/// Holds each message back for a while before passing it on.
///
/// `pauseType` is `delay` (fixed `timeout` in `timeoutUnits`, default five
/// seconds) or `delayv` (milliseconds from `msg.delay`, falling back to the
/// fixed delay). Messages still waiting when the node closes are dropped.
pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let units = str_prop(node, "timeoutUnits").unwrap_or("seconds");
        let unit = unit_secs(units).ok_or_else(|| NodeError::config(format!("Unknown delay unit: {units}")))?;
        let fixed = duration(f64_prop(node, "timeout").unwrap_or(5.0), unit, "delay")?;
        let variable = match str_prop(node, "pauseType").unwrap_or("delay") {
            "delay" => false,
            "delayv" => true,
            other => return Err(NodeError::config(format!("Unsupported pause type: {other}"))),
        };
        let cancel = CancellationToken::new();

        let pending = cancel.clone();
        node.on_input_manual(move |msg, send, done| {
            let wait = if variable {
                msg.get("delay")
                    .and_then(f64_value)
                    .and_then(|ms| duration(ms, 0.001, "msg.delay").ok())
                    .unwrap_or(fixed)
            } else {
                fixed
            };
            let cancel = pending.clone();
            async move {
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sleep(wait) => {
                            send.send(msg);
                            done.complete();
                        }
                    }
                });
                Ok(())
            }
        });
        node.on_close(move || {
            cancel.cancel();
            Ok(())
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delays each message passing through".to_string(),
            category: "function".to_string(),
            inputs: 1,
            outputs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Payload {
    Timestamp,
    Fixed(Value),
}

#[derive(Debug, Clone)]
struct Injection {
    payload: Payload,
    topic: Option<String>,
    once: Option<Duration>,
    repeat: Option<Duration>,
}

impl Injection {
    fn from_node(node: &Node) -> Result<Self, NodeError> {
        let raw = node.property("payload").cloned().unwrap_or(Value::String(String::new()));
        let payload = match str_prop(node, "payloadType").unwrap_or("date") {
            "date" => Payload::Timestamp,
            "json" => match raw {
                Value::String(text) => Payload::Fixed(
                    serde_json::from_str(&text).map_err(|e| NodeError::config(format!("Invalid JSON payload: {e}")))?,
                ),
                other => Payload::Fixed(other),
            },
            "num" => Payload::Fixed(
                f64_value(&raw)
                    .map(|n| json!(n))
                    .ok_or_else(|| NodeError::config(format!("Invalid number payload: {raw}")))?,
            ),
            "bool" => Payload::Fixed(Value::Bool(matches!(&raw, Value::Bool(true)) || raw == json!("true"))),
            _ => Payload::Fixed(raw),
        };

        let once = if bool_prop(node, "once").unwrap_or(false) {
            Some(duration(f64_prop(node, "onceDelay").unwrap_or(0.1), 1.0, "onceDelay")?)
        } else {
            None
        };
        let repeat = match f64_prop(node, "repeat") {
            Some(secs) if secs > 0.0 => Some(duration(secs, 1.0, "repeat interval")?),
            _ => None,
        };

        Ok(Self {
            payload,
            topic: str_prop(node, "topic").map(str::to_string),
            once,
            repeat,
        })
    }

    fn message(&self) -> Message {
        let payload = match &self.payload {
            Payload::Timestamp => json!(Utc::now().timestamp_millis()),
            Payload::Fixed(value) => value.clone(),
        };
        let mut msg = Message::with_payload(payload);
        if let Some(topic) = &self.topic {
            msg.set("topic", topic.as_str());
        }
        msg
    }

    fn inject(&self, node: &Weak<Node>) {
        if let Some(node) = node.upgrade() {
            node.send(self.message());
        }
    }

    async fn run(self: Arc<Self>, node: Weak<Node>, cancel: CancellationToken) {
        if let Some(delay) = self.once {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => self.inject(&node),
            }
        }
        let Some(period) = self.repeat else { return };
        let mut ticks = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticks.tick() => self.inject(&node),
            }
        }
    }
}

/// Starts flows: sends a message once after deploy, on an interval, or
/// whenever it receives a message.
///
/// Properties: `payload` with `payloadType` (`date` by default, `str`,
/// `num`, `bool`, `json`), `topic`, `once` with `onceDelay` seconds and
/// `repeat` seconds.
pub struct InjectNodeFactory;

impl NodeFactory for InjectNodeFactory {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let injection = Arc::new(Injection::from_node(node)?);
        let cancel = CancellationToken::new();

        let on_input = injection.clone();
        node.on_input(move |_, send, _| {
            send.send(on_input.message());
            async { Ok(()) }
        });

        if let Some(period) = injection.repeat {
            tracing::debug!("Inject node {} repeats every {:?}", node.id(), period);
        }
        if injection.once.is_some() || injection.repeat.is_some() {
            let weak = node.handle();
            let timer = cancel.clone();
            node.events().on(NODES_STARTED, move |_| {
                tokio::spawn(injection.clone().run(weak.clone(), timer.clone()));
            });
        }
        node.on_close(move || {
            cancel.cancel();
            Ok(())
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "inject"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Injects a message once, on an interval or on demand".to_string(),
            category: "common".to_string(),
            inputs: 0,
            outputs: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units() {
        assert_eq!(unit_secs("minutes"), Some(60.0));
        assert_eq!(unit_secs("fortnights"), None);
    }
}
