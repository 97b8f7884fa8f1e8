use crate::{LogRecord, Message, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published while flows run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    FlowsStarted {
        flow_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    FlowsStopped {
        timestamp: DateTime<Utc>,
    },
    NodeStatus {
        node_id: String,
        flow_id: Option<String>,
        status: Status,
        timestamp: DateTime<Utc>,
    },
    NodeLog {
        record: LogRecord,
        timestamp: DateTime<Utc>,
    },
    MessageCompleted {
        node_id: String,
        msg_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    NodeError {
        node_id: String,
        message: String,
        msg_id: Option<String>,
        handled: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Publisher bound to one flow.
#[derive(Clone)]
pub struct EventEmitter {
    flow_id: String,
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventEmitter {
    pub fn new(flow_id: impl Into<String>, sender: broadcast::Sender<RuntimeEvent>) -> Self {
        Self {
            flow_id: flow_id.into(),
            sender,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn status(&self, node_id: impl Into<String>, status: Status) {
        self.emit(RuntimeEvent::NodeStatus {
            node_id: node_id.into(),
            flow_id: Some(self.flow_id.clone()),
            status,
            timestamp: Utc::now(),
        });
    }

    pub fn log(&self, record: LogRecord) {
        self.emit(RuntimeEvent::NodeLog {
            record,
            timestamp: Utc::now(),
        });
    }

    pub fn completed(&self, node_id: impl Into<String>, msg: &Message) {
        self.emit(RuntimeEvent::MessageCompleted {
            node_id: node_id.into(),
            msg_id: msg.id().map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub fn error(&self, node_id: impl Into<String>, message: impl Into<String>, msg: Option<&Message>, handled: bool) {
        self.emit(RuntimeEvent::NodeError {
            node_id: node_id.into(),
            message: message.into(),
            msg_id: msg.and_then(Message::id).map(str::to_string),
            handled,
            timestamp: Utc::now(),
        });
    }
}

/// Global event bus
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, flow_id: impl Into<String>) -> EventEmitter {
        EventEmitter::new(flow_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
