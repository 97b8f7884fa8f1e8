//! A [`Flow`] that records everything nodes hand to it, for tests.

use crate::{DeliveryEvent, Flow, LogLevel, LogRecord, Message, Node, NodeEnv, NodeSpec, Status};
use flowcontext::ContextManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[derive(Debug, Clone)]
pub struct RecordedError {
    pub node_id: String,
    pub message: String,
    pub msg: Message,
}

#[derive(Default)]
pub struct RecordingFlow {
    batches: Mutex<Vec<Vec<DeliveryEvent>>>,
    completions: Mutex<Vec<(String, Message)>>,
    errors: Mutex<Vec<RecordedError>>,
    statuses: Mutex<Vec<(String, Status)>>,
    logs: Mutex<Vec<LogRecord>>,
    handle_errors: AtomicBool,
}

impl RecordingFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `handle_error` report errors as handled.
    pub fn set_handles_errors(&self, handled: bool) {
        self.handle_errors.store(handled, Ordering::SeqCst);
    }

    /// Build a node owned by this flow with a fresh context manager.
    pub fn node(self: &Arc<Self>, spec: &NodeSpec) -> Arc<Node> {
        self.node_with(spec, Arc::new(ContextManager::default()))
    }

    pub fn node_with(self: &Arc<Self>, spec: &NodeSpec, contexts: Arc<ContextManager>) -> Arc<Node> {
        Node::new(spec, self.env(contexts))
    }

    pub fn env(self: &Arc<Self>, contexts: Arc<ContextManager>) -> NodeEnv {
        let flow: Weak<dyn Flow> = Arc::downgrade(self) as Weak<dyn Flow>;
        NodeEnv::new(flow, contexts)
    }

    pub fn batches(&self) -> Vec<Vec<DeliveryEvent>> {
        lock(&self.batches).clone()
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        lock(&self.batches).iter().flatten().cloned().collect()
    }

    pub fn completions(&self) -> Vec<(String, Message)> {
        lock(&self.completions).clone()
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        lock(&self.errors).clone()
    }

    pub fn statuses(&self) -> Vec<(String, Status)> {
        lock(&self.statuses).clone()
    }

    /// Log records, metrics excluded.
    pub fn logs(&self) -> Vec<LogRecord> {
        lock(&self.logs)
            .iter()
            .filter(|r| r.level != LogLevel::Metric)
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> Vec<String> {
        lock(&self.logs)
            .iter()
            .filter_map(|r| r.metric_event().map(str::to_string))
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Flow for RecordingFlow {
    fn send(&self, events: Vec<DeliveryEvent>) {
        lock(&self.batches).push(events);
    }

    fn handle_complete(&self, node: &Node, msg: &Message) {
        lock(&self.completions).push((node.id().to_string(), msg.clone()));
    }

    fn handle_error(&self, node: &Node, log_message: &str, msg: &Message) -> bool {
        lock(&self.errors).push(RecordedError {
            node_id: node.id().to_string(),
            message: log_message.to_string(),
            msg: msg.clone(),
        });
        self.handle_errors.load(Ordering::SeqCst)
    }

    fn handle_status(&self, node: &Node, status: Status) {
        lock(&self.statuses).push((node.id().to_string(), status));
    }

    fn log(&self, record: LogRecord) {
        lock(&self.logs).push(record);
    }
}
