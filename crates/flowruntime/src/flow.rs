use flowcore::{
    DeliveryEvent, Destination, EventBus, EventEmitter, Flow, FlowError, LogLevel, LogRecord, Message, Node, Source,
    Status,
};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Node type that receives errors reported by other nodes of its flow.
pub const CATCH_TYPE: &str = "catch";
/// Node type that receives status updates of other nodes of its flow.
pub const STATUS_TYPE: &str = "status";

/// Event emitted on each node a deploy has started.
pub const NODES_STARTED: &str = "nodes-started";

/// A running flow: owns its nodes and delivers everything they send.
///
/// Deliveries are queued and performed by one dispatcher task, batch by
/// batch. The dispatcher runs each handler body in order and hands the
/// handler's future to its own task, so a node waiting on I/O or a timer
/// does not hold up the rest of the flow.
pub struct ActiveFlow {
    id: String,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    queue: mpsc::UnboundedSender<Vec<DeliveryEvent>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    emitter: EventEmitter,
}

impl ActiveFlow {
    /// Create the flow and spawn its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn start(id: impl Into<String>, events: &EventBus) -> Arc<Self> {
        let id = id.into();
        let (queue, rx) = mpsc::unbounded_channel();
        let flow = Arc::new(Self {
            emitter: events.create_emitter(id.clone()),
            id,
            nodes: RwLock::new(HashMap::new()),
            queue,
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(dispatch(Arc::downgrade(&flow), rx, flow.shutdown.clone()));
        tracing::debug!("Started flow {}", flow.id);
        flow
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The handle nodes of this flow are built with.
    pub fn handle(self: &Arc<Self>) -> Weak<dyn Flow> {
        let weak: Weak<ActiveFlow> = Arc::downgrade(self);
        weak
    }

    pub fn add_node(&self, node: Arc<Node>) {
        self.nodes_mut().insert(node.id().to_string(), node);
    }

    pub fn remove_node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes_mut().remove(id)
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes().get(id).cloned()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queue a message for one node of this flow, as if it had been wired in.
    pub fn inject(&self, target: &str, msg: Message) -> Result<(), FlowError> {
        if self.is_stopped() {
            return Err(FlowError::Stopped);
        }
        if !self.nodes().contains_key(target) {
            return Err(FlowError::NodeNotFound(target.to_string()));
        }
        let event = DeliveryEvent {
            msg: Arc::new(msg),
            source: Source {
                id: String::new(),
                port: 0,
                node: Weak::new(),
            },
            destination: Destination { id: target.to_string() },
            clone_message: false,
        };
        self.queue.send(vec![event]).map_err(|_| FlowError::Stopped)
    }

    /// Stop delivering and close every node. Queued deliveries are dropped.
    pub async fn stop(&self, removed: bool) {
        self.stopped.store(true, Ordering::Release);
        self.shutdown.cancel();
        let nodes: Vec<Arc<Node>> = self.nodes_mut().drain().map(|(_, node)| node).collect();
        join_all(nodes.iter().map(|node| node.close(removed))).await;
        tracing::debug!("Stopped flow {} ({} nodes closed)", self.id, nodes.len());
    }

    fn deliver(&self, batch: Vec<DeliveryEvent>) {
        for event in batch {
            if self.is_stopped() {
                tracing::debug!("Flow {} is stopped; dropping the rest of a batch", self.id);
                return;
            }
            let Some(node) = self.node(&event.destination.id) else {
                tracing::debug!(
                    "Dropping delivery from {} to missing node {}",
                    event.source.id,
                    event.destination.id
                );
                continue;
            };
            tokio::spawn(node.start_receive(Some(event.take_message())));
        }
    }

    fn nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Node>>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Node>>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Nodes of `node_type` whose `scope` covers `source`, ordered by id.
    fn listeners(&self, node_type: &str, source: &str) -> Vec<Arc<Node>> {
        let mut found: Vec<Arc<Node>> = self
            .nodes()
            .values()
            .filter(|n| n.node_type() == node_type && in_scope(n, source))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// Catch nodes for an error from `source`. Nodes marked `uncaught` only
    /// get errors no other catch node takes.
    fn catchers(&self, source: &str) -> Vec<Arc<Node>> {
        let (uncaught, scoped): (Vec<_>, Vec<_>) = self
            .listeners(CATCH_TYPE, source)
            .into_iter()
            .partition(|n| n.property("uncaught").and_then(Value::as_bool).unwrap_or(false));
        if scoped.is_empty() {
            uncaught
        } else {
            scoped
        }
    }

    fn fan_out(&self, from: &Node, targets: &[Arc<Node>], msg: Message) {
        let msg = Arc::new(msg);
        let events = targets
            .iter()
            .enumerate()
            .map(|(i, target)| DeliveryEvent {
                msg: msg.clone(),
                source: Source {
                    id: from.id().to_string(),
                    port: 0,
                    node: from.handle(),
                },
                destination: Destination {
                    id: target.id().to_string(),
                },
                clone_message: i > 0,
            })
            .collect();
        self.send(events);
    }
}

fn in_scope(node: &Node, source: &str) -> bool {
    match node.property("scope") {
        Some(Value::Array(ids)) => ids.iter().any(|id| id.as_str() == Some(source)),
        _ => true,
    }
}

fn source_of(node: &Node) -> Map<String, Value> {
    let mut source = Map::new();
    source.insert("id".into(), json!(node.id()));
    source.insert("type".into(), json!(node.node_type()));
    if let Some(name) = node.name() {
        source.insert("name".into(), json!(name));
    }
    source
}

async fn dispatch(
    flow: Weak<ActiveFlow>,
    mut rx: mpsc::UnboundedReceiver<Vec<DeliveryEvent>>,
    shutdown: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        let Some(flow) = flow.upgrade() else { break };
        flow.deliver(batch);
    }
}

impl Flow for ActiveFlow {
    fn send(&self, events: Vec<DeliveryEvent>) {
        if self.is_stopped() {
            tracing::debug!("Flow {} is stopped; dropped {} deliveries", self.id, events.len());
            return;
        }
        if let Err(rejected) = self.queue.send(events) {
            tracing::debug!("Flow {} dispatcher is gone; dropped {} deliveries", self.id, rejected.0.len());
        }
    }

    fn handle_complete(&self, node: &Node, msg: &Message) {
        self.emitter.completed(node.id(), msg);
    }

    fn handle_error(&self, node: &Node, log_message: &str, msg: &Message) -> bool {
        let catchers = if node.node_type() == CATCH_TYPE {
            Vec::new()
        } else {
            self.catchers(node.id())
        };
        let handled = !catchers.is_empty();
        if handled {
            let count = msg
                .get("error")
                .and_then(|e| e.get("source"))
                .filter(|s| s.get("id").and_then(Value::as_str) == Some(node.id()))
                .and_then(|s| s.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            let mut source = source_of(node);
            source.insert("count".into(), json!(count));
            let mut error_msg = msg.clone();
            error_msg.set("error", json!({ "message": log_message, "source": source }));
            self.fan_out(node, &catchers, error_msg);
        }
        self.emitter.error(node.id(), log_message, Some(msg), handled);
        handled
    }

    fn handle_status(&self, node: &Node, status: Status) {
        self.emitter.status(node.id(), status.clone());
        if node.node_type() == STATUS_TYPE {
            return;
        }
        let listeners = self.listeners(STATUS_TYPE, node.id());
        if listeners.is_empty() {
            return;
        }
        let mut body = match serde_json::to_value(&status) {
            Ok(Value::Object(body)) => body,
            _ => Map::new(),
        };
        body.insert("source".into(), Value::Object(source_of(node)));
        let mut msg = Message::new();
        msg.set("status", Value::Object(body));
        self.fan_out(node, &listeners, msg);
    }

    fn log(&self, record: LogRecord) {
        let text = record.text();
        let node = record.name.as_deref().unwrap_or(&record.id);
        match record.level {
            LogLevel::Trace => tracing::trace!("[{}:{}] {}", record.node_type, node, text),
            LogLevel::Debug => tracing::debug!("[{}:{}] {}", record.node_type, node, text),
            LogLevel::Info => tracing::info!("[{}:{}] {}", record.node_type, node, text),
            LogLevel::Warn => tracing::warn!("[{}:{}] {}", record.node_type, node, text),
            LogLevel::Error => tracing::error!("[{}:{}] {}", record.node_type, node, text),
            LogLevel::Metric => tracing::trace!(target: "flowruntime::metric", "{}", text),
        }
        self.emitter.log(record);
    }
}

impl std::fmt::Debug for ActiveFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveFlow")
            .field("id", &self.id)
            .field("nodes", &self.node_ids())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
