//! Core abstractions for the flow engine
//!
//! Messages, nodes and the flow interface they are routed through, plus
//! status and log records, lifecycle hooks, the flow configuration model and
//! the runtime event bus.

mod config;
mod error;
pub mod events;
mod flow;
mod handlers;
pub mod hooks;
mod log;
mod message;
mod node;
mod status;
pub mod testing;

pub use config::{FlowConfig, FlowId, FlowSpec, NodeId, NodeSpec};
pub use error::{ConfigError, FlowError, NodeError};
pub use events::*;
pub use flow::{DeliveryEvent, Destination, Flow, Source};
pub use handlers::{Completion, Done, HandlerId, InputState, NodeEvents, NodeSender};
pub use hooks::{HookOutcome, Hooks};
pub use log::{LogLevel, LogRecord};
pub use message::{generate_id, Message, MSG_ID};
pub use node::{Node, NodeEnv, Output, PortOutput, SendStrategy};
pub use status::Status;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
