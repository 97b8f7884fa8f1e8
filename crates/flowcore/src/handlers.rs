//! Handler storage for nodes: input handlers, close callbacks, completion
//! tracking and the observer used for every other named event.

use crate::{Message, Node, NodeError, Output};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Identifies a registered handler so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// How an input handler signals that it is finished with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done when the handler's future resolves `Ok`.
    Auto,
    /// The handler calls [`Done`] itself, possibly much later.
    Manual,
}

pub type InputFn = dyn Fn(Message, NodeSender, Done) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync;

#[derive(Clone)]
pub(crate) struct InputHandler {
    pub(crate) id: HandlerId,
    pub(crate) completion: Completion,
    pub(crate) func: Arc<InputFn>,
}

impl InputHandler {
    pub(crate) fn new<F, Fut>(id: HandlerId, completion: Completion, f: F) -> Self
    where
        F: Fn(Message, NodeSender, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        let func: Arc<InputFn> = Arc::new(move |msg, send, done| f(msg, send, done).boxed());
        Self { id, completion, func }
    }
}

/// Observable shape of the input handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    None,
    Single,
    Multi(usize),
}

/// Input handlers: nothing, one stored directly, or a list of two or more.
#[derive(Clone, Default)]
pub(crate) enum InputHandlers {
    #[default]
    None,
    Single(InputHandler),
    Multi(Vec<InputHandler>),
}

impl InputHandlers {
    pub(crate) fn add(&mut self, handler: InputHandler) {
        *self = match std::mem::take(self) {
            InputHandlers::None => InputHandlers::Single(handler),
            InputHandlers::Single(existing) => InputHandlers::Multi(vec![existing, handler]),
            InputHandlers::Multi(mut list) => {
                list.push(handler);
                InputHandlers::Multi(list)
            }
        };
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let (next, removed) = match std::mem::take(self) {
            InputHandlers::Single(h) if h.id == id => (InputHandlers::None, true),
            InputHandlers::Multi(mut list) => {
                let before = list.len();
                list.retain(|h| h.id != id);
                let removed = list.len() != before;
                let next = match list.len() {
                    0 => InputHandlers::None,
                    1 => InputHandlers::Single(list.remove(0)),
                    _ => InputHandlers::Multi(list),
                };
                (next, removed)
            }
            other => (other, false),
        };
        *self = next;
        removed
    }

    pub(crate) fn clear(&mut self) {
        *self = InputHandlers::None;
    }

    pub(crate) fn state(&self) -> InputState {
        match self {
            InputHandlers::None => InputState::None,
            InputHandlers::Single(_) => InputState::Single,
            InputHandlers::Multi(list) => InputState::Multi(list.len()),
        }
    }
}

pub type CloseFn = dyn Fn() -> Result<(), NodeError> + Send + Sync;
pub type DeferredCloseFn = dyn Fn(bool) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync;

#[derive(Clone)]
pub(crate) enum CloseHandler {
    /// Runs inline, in registration order.
    Immediate(Arc<CloseFn>),
    /// Receives the `removed` flag and is awaited with the others.
    Deferred(Arc<DeferredCloseFn>),
}

/// Emits messages on behalf of a node.
#[derive(Clone)]
pub struct NodeSender {
    node: Weak<Node>,
}

impl NodeSender {
    pub(crate) fn new(node: Weak<Node>) -> Self {
        Self { node }
    }

    pub fn send(&self, output: impl Into<Output>) {
        match self.node.upgrade() {
            Some(node) => node.send(output),
            None => tracing::debug!("Dropping send from a node that no longer exists"),
        }
    }
}

/// Completion signal for one handler's share of one received message.
///
/// The first call wins; later calls on the same handle or its clones are
/// ignored. When every handler of the node has signalled, the node reports
/// the message complete.
#[derive(Clone)]
pub struct Done {
    node: Weak<Node>,
    msg: Arc<Message>,
    remaining: Arc<AtomicUsize>,
    fired: Arc<AtomicBool>,
}

impl Done {
    pub(crate) fn new(node: Weak<Node>, msg: Arc<Message>, remaining: Arc<AtomicUsize>) -> Self {
        Self {
            node,
            msg,
            remaining,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn complete(&self) {
        self.finish(None);
    }

    pub fn fail(&self, error: NodeError) {
        self.finish(Some(error));
    }

    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn finish(&self, error: Option<NodeError>) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(node) = self.node.upgrade() {
            node.complete(&self.msg, error);
        }
    }
}

pub type EventFn = dyn Fn(&Value) + Send + Sync;

/// Observer for named node events other than input and close.
#[derive(Default)]
pub struct NodeEvents {
    listeners: RwLock<HashMap<String, Vec<(HandlerId, Arc<EventFn>)>>>,
    next_id: AtomicUsize,
}

impl NodeEvents {
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed) as u64);
        let listener: Arc<EventFn> = Arc::new(listener);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.into())
            .or_default()
            .push((id, listener));
        id
    }

    /// Call every listener for `event`; returns how many there were.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let listeners: Vec<Arc<EventFn>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in listeners.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        listeners.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn remove_all(&self, event: &str) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }
}
