//! Standard node library
//!
//! Built-in node types: inject, debug, delay, json, catch and status.

mod debug;
mod observe;
mod props;
mod time;
mod transform;

pub use debug::DebugNodeFactory;
pub use observe::{CatchNodeFactory, StatusNodeFactory};
pub use time::{DelayNodeFactory, InjectNodeFactory};
pub use transform::JsonNodeFactory;
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(InjectNodeFactory));
    registry.register(Arc::new(DebugNodeFactory));
    registry.register(Arc::new(DelayNodeFactory));
    registry.register(Arc::new(JsonNodeFactory));
    registry.register(Arc::new(CatchNodeFactory));
    registry.register(Arc::new(StatusNodeFactory));
}
