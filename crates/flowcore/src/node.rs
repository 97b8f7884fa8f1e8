use crate::handlers::{CloseHandler, InputHandler, InputHandlers};
use crate::hooks::{CompleteEvent, HookOutcome, Hooks, ReceiveEvent};
use crate::{
    generate_id, Completion, DeliveryEvent, Destination, Done, Flow, HandlerId, InputState, LogLevel, LogRecord,
    Message, NodeError, NodeEvents, NodeSender, NodeSpec, Source, Status,
};
use flowcontext::{Context, ContextManager};
use futures::future::{self, join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};

/// How `send` routes, chosen whenever the wiring changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStrategy {
    /// Nothing is wired: sending does nothing.
    NoOp,
    /// One output with one wire: a single message goes straight there.
    DirectTarget(String),
    Fanout,
}

/// Messages for one output port.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PortOutput {
    #[default]
    Empty,
    One(Message),
    Many(Vec<Message>),
}

impl PortOutput {
    fn into_messages(self) -> Vec<Message> {
        match self {
            PortOutput::Empty => Vec::new(),
            PortOutput::One(msg) => vec![msg],
            PortOutput::Many(msgs) => msgs,
        }
    }
}

impl From<Message> for PortOutput {
    fn from(msg: Message) -> Self {
        PortOutput::One(msg)
    }
}

impl From<Option<Message>> for PortOutput {
    fn from(msg: Option<Message>) -> Self {
        msg.map_or(PortOutput::Empty, PortOutput::One)
    }
}

impl From<Vec<Message>> for PortOutput {
    fn from(msgs: Vec<Message>) -> Self {
        PortOutput::Many(msgs)
    }
}

/// The argument to [`Node::send`]: one message for port 0, or one entry per port.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Output {
    #[default]
    Empty,
    Single(Message),
    Ports(Vec<PortOutput>),
}

impl Output {
    /// Interpret a JSON value the way a script would hand it to `send`.
    /// Anything that is not an object is dropped from its slot.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(fields) => Output::Single(Message::from(fields)),
            Value::Array(ports) => Output::Ports(
                ports
                    .into_iter()
                    .map(|slot| match slot {
                        Value::Object(fields) => PortOutput::One(Message::from(fields)),
                        Value::Array(msgs) => {
                            PortOutput::Many(msgs.into_iter().filter_map(Message::from_value).collect())
                        }
                        _ => PortOutput::Empty,
                    })
                    .collect(),
            ),
            _ => Output::Empty,
        }
    }
}

impl From<Message> for Output {
    fn from(msg: Message) -> Self {
        Output::Single(msg)
    }
}

impl From<Option<Message>> for Output {
    fn from(msg: Option<Message>) -> Self {
        msg.map_or(Output::Empty, Output::Single)
    }
}

impl From<Vec<PortOutput>> for Output {
    fn from(ports: Vec<PortOutput>) -> Self {
        Output::Ports(ports)
    }
}

impl From<Vec<Option<Message>>> for Output {
    fn from(ports: Vec<Option<Message>>) -> Self {
        Output::Ports(ports.into_iter().map(PortOutput::from).collect())
    }
}

struct Routing {
    wires: Vec<Vec<String>>,
    wire_count: usize,
    strategy: SendStrategy,
}

impl Routing {
    fn new(wires: Vec<Vec<String>>) -> Self {
        let wire_count = wires.iter().map(Vec::len).sum();
        let strategy = match wires.as_slice() {
            _ if wire_count == 0 => SendStrategy::NoOp,
            [only] if only.len() == 1 => SendStrategy::DirectTarget(only[0].clone()),
            _ => SendStrategy::Fanout,
        };
        Self {
            wires,
            wire_count,
            strategy,
        }
    }
}

/// What a node is wired into: its flow, the context manager and the hooks.
#[derive(Clone)]
pub struct NodeEnv {
    pub flow: Weak<dyn Flow>,
    pub contexts: Arc<ContextManager>,
    pub hooks: Arc<Hooks>,
}

impl NodeEnv {
    pub fn new(flow: Weak<dyn Flow>, contexts: Arc<ContextManager>) -> Self {
        Self {
            flow,
            contexts,
            hooks: Arc::new(Hooks::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// A live node: routes what it sends, dispatches what it receives and runs
/// its teardown when closed.
pub struct Node {
    id: String,
    node_type: String,
    z: Option<String>,
    name: Option<String>,
    alias: Option<String>,
    properties: Map<String, Value>,
    routing: RwLock<Arc<Routing>>,
    inputs: RwLock<InputHandlers>,
    closers: Mutex<Vec<(HandlerId, CloseHandler)>>,
    events: NodeEvents,
    context: OnceLock<Arc<Context>>,
    env: NodeEnv,
    me: Weak<Node>,
    next_handler: AtomicU64,
}

impl Node {
    pub fn new(spec: &NodeSpec, env: NodeEnv) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: spec.id.clone(),
            node_type: spec.node_type.clone(),
            z: spec.z.clone(),
            name: spec.name.clone(),
            alias: spec.alias.clone(),
            properties: spec.properties.clone(),
            routing: RwLock::new(Arc::new(Routing::new(spec.wires.clone()))),
            inputs: RwLock::new(InputHandlers::None),
            closers: Mutex::new(Vec::new()),
            events: NodeEvents::default(),
            context: OnceLock::new(),
            env,
            me: me.clone(),
            next_handler: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn z(&self) -> Option<&str> {
        self.z.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn events(&self) -> &NodeEvents {
        &self.events
    }

    /// Replace the wiring table; the routing strategy is recomputed with it.
    pub fn update_wires(&self, wires: Vec<Vec<String>>) {
        let routing = Arc::new(Routing::new(wires));
        *self.routing.write().unwrap_or_else(PoisonError::into_inner) = routing;
    }

    pub fn wires(&self) -> Vec<Vec<String>> {
        self.routing().wires.clone()
    }

    pub fn wire_count(&self) -> usize {
        self.routing().wire_count
    }

    pub fn send_strategy(&self) -> SendStrategy {
        self.routing().strategy.clone()
    }

    fn routing(&self) -> Arc<Routing> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Register an input handler that is done once its future resolves `Ok`.
    pub fn on_input<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(Message, NodeSender, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        self.add_input(Completion::Auto, handler)
    }

    /// Register an input handler that signals completion through [`Done`].
    pub fn on_input_manual<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(Message, NodeSender, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        self.add_input(Completion::Manual, handler)
    }

    fn add_input<F, Fut>(&self, completion: Completion, handler: F) -> HandlerId
    where
        F: Fn(Message, NodeSender, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        let id = self.next_handler_id();
        let handler = InputHandler::new(id, completion, handler);
        self.inputs.write().unwrap_or_else(PoisonError::into_inner).add(handler);
        id
    }

    pub fn remove_input(&self, id: HandlerId) -> bool {
        self.inputs.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    pub fn remove_all_inputs(&self) {
        self.inputs.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn input_state(&self) -> InputState {
        self.inputs.read().unwrap_or_else(PoisonError::into_inner).state()
    }

    /// Register a teardown callback that runs inline during `close`.
    pub fn on_close<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() -> Result<(), NodeError> + Send + Sync + 'static,
    {
        self.add_close(CloseHandler::Immediate(Arc::new(callback)))
    }

    /// Register a teardown callback that receives the `removed` flag and is
    /// awaited alongside the others.
    pub fn on_close_async<F, Fut>(&self, callback: F) -> HandlerId
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        self.add_close(CloseHandler::Deferred(Arc::new(move |removed| callback(removed).boxed())))
    }

    fn add_close(&self, handler: CloseHandler) -> HandlerId {
        let id = self.next_handler_id();
        self.closers().push((id, handler));
        id
    }

    pub fn remove_close(&self, id: HandlerId) -> bool {
        let mut closers = self.closers();
        let before = closers.len();
        closers.retain(|(existing, _)| *existing != id);
        closers.len() != before
    }

    fn closers(&self) -> MutexGuard<'_, Vec<(HandlerId, CloseHandler)>> {
        self.closers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed))
    }

    fn flow(&self) -> Option<Arc<dyn Flow>> {
        self.env.flow.upgrade()
    }

    /// A weak handle to this node.
    pub fn handle(&self) -> Weak<Node> {
        self.me.clone()
    }

    pub fn sender(&self) -> NodeSender {
        NodeSender::new(self.me.clone())
    }

    /// Route messages to the wired destinations as one batch.
    pub fn send(&self, output: impl Into<Output>) {
        let routing = self.routing();
        let output = output.into();
        let ports = match (&routing.strategy, output) {
            (SendStrategy::NoOp, _) | (_, Output::Empty) => return,
            (SendStrategy::DirectTarget(target), Output::Single(mut msg)) => {
                let msg_id = msg.ensure_id();
                self.metric_id("send", Some(msg_id.as_str()), None);
                let event = DeliveryEvent {
                    msg: Arc::new(msg),
                    source: self.source(0),
                    destination: Destination { id: target.clone() },
                    clone_message: false,
                };
                self.dispatch(vec![event]);
                return;
            }
            (_, Output::Single(msg)) => vec![vec![msg]],
            (_, Output::Ports(ports)) => ports.into_iter().map(PortOutput::into_messages).collect(),
        };

        let mut ports: Vec<(usize, &Vec<String>, Vec<Message>)> = routing
            .wires
            .iter()
            .zip(ports)
            .enumerate()
            .filter(|(_, (wires, msgs))| !wires.is_empty() && !msgs.is_empty())
            .map(|(port, (wires, msgs))| (port, wires, msgs))
            .collect();

        let sent_id = ports
            .iter()
            .flat_map(|(_, _, msgs)| msgs.iter())
            .find_map(|m| m.id().map(str::to_string))
            .unwrap_or_else(generate_id);
        for (_, _, msgs) in ports.iter_mut() {
            for msg in msgs.iter_mut().filter(|m| m.id().is_none()) {
                msg.set_id(sent_id.clone());
            }
        }

        let mut events = Vec::new();
        for (port, wires, msgs) in ports {
            let msgs: Vec<Arc<Message>> = msgs.into_iter().map(Arc::new).collect();
            for target in wires {
                for msg in &msgs {
                    events.push(DeliveryEvent {
                        msg: msg.clone(),
                        source: self.source(port),
                        destination: Destination { id: target.clone() },
                        clone_message: !events.is_empty(),
                    });
                }
            }
        }
        self.metric_id("send", Some(sent_id.as_str()), None);
        if !events.is_empty() {
            self.dispatch(events);
        }
    }

    fn source(&self, port: usize) -> Source {
        Source {
            id: self.id.clone(),
            port,
            node: self.me.clone(),
        }
    }

    fn dispatch(&self, events: Vec<DeliveryEvent>) {
        match self.flow() {
            Some(flow) => flow.send(events),
            None => tracing::debug!("Node {} has no flow; dropped {} deliveries", self.id, events.len()),
        }
    }

    /// Deliver a message to this node's input handlers and wait until each
    /// handler's future has resolved.
    ///
    /// A failing or panicking handler is reported through [`Node::error`]
    /// and does not stop the others.
    pub async fn receive(&self, msg: Option<Message>) {
        self.start_receive(msg).await;
    }

    /// Run the synchronous part of a delivery: the receive hooks and the body
    /// of every input handler, in registration order. The returned future
    /// drives the handlers' asynchronous work to completion and may be
    /// spawned so the caller can move on to the next delivery.
    pub fn start_receive(&self, msg: Option<Message>) -> BoxFuture<'static, ()> {
        let mut msg = msg.unwrap_or_default();
        msg.ensure_id();
        self.metric("receive", &msg, None);

        let event = ReceiveEvent {
            msg: &msg,
            node_id: &self.id,
            node_type: &self.node_type,
        };
        match self.env.hooks.trigger_on_receive(&event) {
            Ok(HookOutcome::Continue) => {}
            Ok(HookOutcome::Halt) => return future::ready(()).boxed(),
            Err(e) => {
                self.error(&e, None);
                return future::ready(()).boxed();
            }
        }

        let handlers = self.inputs.read().unwrap_or_else(PoisonError::into_inner).clone();
        let list = match handlers {
            InputHandlers::None => Vec::new(),
            InputHandlers::Single(handler) => vec![handler],
            InputHandlers::Multi(list) => list,
        };
        let original = Arc::new(msg.clone());
        let remaining = Arc::new(AtomicUsize::new(list.len()));
        let mut running = Vec::with_capacity(list.len());
        for handler in list {
            let done = Done::new(self.me.clone(), original.clone(), remaining.clone());
            let call = catch_unwind(AssertUnwindSafe(|| (handler.func)(msg.clone(), self.sender(), done.clone())));
            match call {
                Ok(future) => running.push((future, handler.completion, done)),
                Err(panic) => self.error(NodeError::Panicked(panic_text(panic)), Some(&*original)),
            }
        }

        let event = ReceiveEvent {
            msg: &msg,
            node_id: &self.id,
            node_type: &self.node_type,
        };
        if let Err(e) = self.env.hooks.trigger_post_receive(&event) {
            self.error(&e, None);
        }

        let node = self.me.clone();
        async move {
            let settled = running.into_iter().map(|(pending, completion, done)| {
                let node = node.clone();
                let original = original.clone();
                async move {
                    let result = AssertUnwindSafe(pending).catch_unwind().await;
                    let Some(node) = node.upgrade() else { return };
                    match result {
                        Ok(Ok(())) => {
                            if completion == Completion::Auto {
                                done.complete();
                            }
                        }
                        Ok(Err(e)) => node.error(&e, Some(&*original)),
                        Err(panic) => node.error(NodeError::Panicked(panic_text(panic)), Some(&*original)),
                    }
                }
            });
            join_all(settled).await;
        }
        .boxed()
    }

    /// Called once every handler has signalled for a message.
    pub(crate) fn complete(&self, msg: &Message, error: Option<NodeError>) {
        self.metric("done", msg, None);
        let event = CompleteEvent {
            msg,
            error: error.as_ref(),
            node_id: &self.id,
            node_type: &self.node_type,
        };
        if let Err(e) = self.env.hooks.trigger_on_complete(&event) {
            self.error(&e, None);
        }
        match error {
            Some(e) => self.error(&e, Some(msg)),
            None => {
                if let Some(flow) = self.flow() {
                    flow.handle_complete(self, msg);
                }
            }
        }
    }

    /// Run teardown. Failing callbacks are logged and skipped; the node's
    /// input handlers are dropped and its context deleted afterwards.
    pub async fn close(&self, removed: bool) {
        let closers: Vec<CloseHandler> = self.closers().iter().map(|(_, h)| h.clone()).collect();
        let mut pending = Vec::new();
        for closer in closers {
            match closer {
                CloseHandler::Immediate(callback) => match catch_unwind(AssertUnwindSafe(|| callback())) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.close_failed(&e.to_string()),
                    Err(panic) => self.close_failed(&panic_text(panic)),
                },
                CloseHandler::Deferred(callback) => match catch_unwind(AssertUnwindSafe(|| callback(removed))) {
                    Ok(future) => pending.push(AssertUnwindSafe(future).catch_unwind()),
                    Err(panic) => self.close_failed(&panic_text(panic)),
                },
            }
        }
        for result in join_all(pending).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.close_failed(&e.to_string()),
                Err(panic) => self.close_failed(&panic_text(panic)),
            }
        }

        self.remove_all_inputs();
        if self.context.get().is_some() {
            let scope = self.alias.as_deref().unwrap_or(&self.id);
            if let Err(e) = self.env.contexts.delete(scope, self.z.as_deref()).await {
                tracing::warn!("Failed to delete context for node {}: {}", self.id, e);
            }
        }
    }

    fn close_failed(&self, reason: &str) {
        tracing::warn!("Close handler of node {} ({}) failed: {}", self.id, self.node_type, reason);
    }

    /// This node's context, created on first use.
    pub fn context(&self) -> Arc<Context> {
        self.context
            .get_or_init(|| {
                let scope = self.alias.as_deref().unwrap_or(&self.id);
                self.env.contexts.get(scope, self.z.as_deref())
            })
            .clone()
    }

    pub fn status(&self, status: impl Into<Status>) {
        if let Some(flow) = self.flow() {
            flow.handle_status(self, status.into());
        }
    }

    pub fn log(&self, msg: impl Into<Value>) {
        self.log_at(LogLevel::Info, msg.into());
    }

    pub fn warn(&self, msg: impl Into<Value>) {
        self.log_at(LogLevel::Warn, msg.into());
    }

    pub fn debug(&self, msg: impl Into<Value>) {
        self.log_at(LogLevel::Debug, msg.into());
    }

    pub fn trace(&self, msg: impl Into<Value>) {
        self.log_at(LogLevel::Trace, msg.into());
    }

    /// Report an error. With a message the flow may handle it (catch nodes);
    /// otherwise, or if nothing handles it, it is logged.
    pub fn error(&self, log_message: impl ToString, msg: Option<&Message>) {
        let text = log_message.to_string();
        let handled = match (msg, self.flow()) {
            (Some(msg), Some(flow)) => flow.handle_error(self, &text, msg),
            _ => false,
        };
        if !handled {
            self.log_at(LogLevel::Error, Value::String(text));
        }
    }

    /// Emit a `node.<type>.<event>` metric for a message.
    pub fn metric(&self, event: &str, msg: &Message, value: Option<Value>) {
        self.metric_id(event, msg.id(), value);
    }

    fn metric_id(&self, event: &str, msg_id: Option<&str>, value: Option<Value>) {
        let body = LogRecord::metric_body(format!("node.{}.{}", self.node_type, event), msg_id, value);
        self.log_at(LogLevel::Metric, body);
    }

    fn log_at(&self, level: LogLevel, msg: Value) {
        let record = LogRecord {
            level,
            id: self.id.clone(),
            node_type: self.node_type.clone(),
            msg,
            z: self.z.clone(),
            name: self.name.clone(),
            alias: self.alias.clone(),
        };
        match self.flow() {
            Some(flow) => flow.log(record),
            None => tracing::debug!("[{}:{}] {}", self.node_type, self.id, record.text()),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.node_type)
            .field("z", &self.z)
            .finish()
    }
}

fn panic_text(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wires(ports: &[&[&str]]) -> Vec<Vec<String>> {
        ports
            .iter()
            .map(|p| p.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn strategy_follows_wiring() {
        assert_eq!(Routing::new(wires(&[])).strategy, SendStrategy::NoOp);
        assert_eq!(Routing::new(wires(&[&[], &[]])).strategy, SendStrategy::NoOp);
        assert_eq!(
            Routing::new(wires(&[&["b"]])).strategy,
            SendStrategy::DirectTarget("b".into())
        );
        assert_eq!(Routing::new(wires(&[&["b", "c"]])).strategy, SendStrategy::Fanout);
        assert_eq!(Routing::new(wires(&[&["b"], &[]])).strategy, SendStrategy::Fanout);
        assert_eq!(Routing::new(wires(&[&["b"], &["c"]])).wire_count, 2);
    }

    #[test]
    fn output_from_json_drops_non_objects() {
        let output = Output::from_json(serde_json::json!([{"a": 1}, null, 5, [{"b": 2}, "x"]]));
        let Output::Ports(ports) = output else {
            panic!("expected ports");
        };
        assert_eq!(ports.len(), 4);
        assert!(matches!(&ports[0], PortOutput::One(_)));
        assert_eq!(ports[1], PortOutput::Empty);
        assert_eq!(ports[2], PortOutput::Empty);
        assert!(matches!(&ports[3], PortOutput::Many(m) if m.len() == 1));
        assert_eq!(Output::from_json(Value::Null), Output::Empty);
    }
}
