//! Message lifecycle hooks.
//!
//! Hooks are registered under an id so they can be removed again. An
//! `on_receive` hook may halt delivery; any hook may fail, which is reported
//! through the receiving node's error path.

use crate::{Message, NodeError};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// Stop the message here; the node's input handlers are not invoked.
    Halt,
}

pub struct ReceiveEvent<'a> {
    pub msg: &'a Message,
    pub node_id: &'a str,
    pub node_type: &'a str,
}

pub struct CompleteEvent<'a> {
    pub msg: &'a Message,
    pub error: Option<&'a NodeError>,
    pub node_id: &'a str,
    pub node_type: &'a str,
}

pub type ReceiveHook = Arc<dyn Fn(&ReceiveEvent<'_>) -> Result<HookOutcome, NodeError> + Send + Sync>;
pub type PostReceiveHook = Arc<dyn Fn(&ReceiveEvent<'_>) -> Result<(), NodeError> + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(&CompleteEvent<'_>) -> Result<(), NodeError> + Send + Sync>;

type Registered<T> = RwLock<Vec<(String, T)>>;

#[derive(Default)]
pub struct Hooks {
    on_receive: Registered<ReceiveHook>,
    post_receive: Registered<PostReceiveHook>,
    on_complete: Registered<CompleteHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_on_receive<F>(&self, id: impl Into<String>, hook: F)
    where
        F: Fn(&ReceiveEvent<'_>) -> Result<HookOutcome, NodeError> + Send + Sync + 'static,
    {
        let hook: ReceiveHook = Arc::new(hook);
        push(&self.on_receive, id.into(), hook);
    }

    pub fn add_post_receive<F>(&self, id: impl Into<String>, hook: F)
    where
        F: Fn(&ReceiveEvent<'_>) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        let hook: PostReceiveHook = Arc::new(hook);
        push(&self.post_receive, id.into(), hook);
    }

    pub fn add_on_complete<F>(&self, id: impl Into<String>, hook: F)
    where
        F: Fn(&CompleteEvent<'_>) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        let hook: CompleteHook = Arc::new(hook);
        push(&self.on_complete, id.into(), hook);
    }

    /// Remove every hook registered under `id`.
    pub fn remove(&self, id: &str) {
        retain(&self.on_receive, id);
        retain(&self.post_receive, id);
        retain(&self.on_complete, id);
    }

    pub fn clear(&self) {
        clear(&self.on_receive);
        clear(&self.post_receive);
        clear(&self.on_complete);
    }

    pub fn is_empty(&self) -> bool {
        snapshot(&self.on_receive).is_empty()
            && snapshot(&self.post_receive).is_empty()
            && snapshot(&self.on_complete).is_empty()
    }

    /// Runs hooks in registration order until one halts or fails.
    pub fn trigger_on_receive(&self, event: &ReceiveEvent<'_>) -> Result<HookOutcome, NodeError> {
        for hook in snapshot(&self.on_receive) {
            if hook(event)? == HookOutcome::Halt {
                return Ok(HookOutcome::Halt);
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub fn trigger_post_receive(&self, event: &ReceiveEvent<'_>) -> Result<(), NodeError> {
        snapshot(&self.post_receive).iter().try_for_each(|hook| hook(event))
    }

    pub fn trigger_on_complete(&self, event: &CompleteEvent<'_>) -> Result<(), NodeError> {
        snapshot(&self.on_complete).iter().try_for_each(|hook| hook(event))
    }
}

fn push<T>(list: &Registered<T>, id: String, hook: T) {
    list.write().unwrap_or_else(PoisonError::into_inner).push((id, hook));
}

fn retain<T>(list: &Registered<T>, id: &str) {
    list.write()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(hook_id, _)| hook_id != id);
}

fn clear<T>(list: &Registered<T>) {
    list.write().unwrap_or_else(PoisonError::into_inner).clear();
}

// Hooks are cloned out so none runs while the lock is held.
fn snapshot<T: Clone>(list: &Registered<T>) -> Vec<T> {
    list.read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, hook)| hook.clone())
        .collect()
}
