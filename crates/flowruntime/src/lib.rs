//! Flow runtime
//!
//! This crate provides the node-type registry, the flow that routes
//! deliveries between the nodes it owns, and the runtime that deploys flow
//! configurations and manages their lifecycle.

mod error;
mod flow;
mod registry;
mod runtime;
mod settings;

pub use error::RuntimeError;
pub use flow::{ActiveFlow, CATCH_TYPE, NODES_STARTED, STATUS_TYPE};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry};
pub use runtime::{DeploySummary, FlowRuntime, RuntimeConfig};
pub use settings::Settings;
