//! Nodes the flow routes to on its own: errors go to `catch`, status
//! changes to `status`. Both pass what they receive straight on; the flow
//! decides what reaches them from their `scope` (all nodes when absent).

use flowcore::{Node, NodeError};
use flowruntime::{NodeFactory, NodeMetadata, CATCH_TYPE, STATUS_TYPE};
use std::sync::Arc;

fn forward(node: &Arc<Node>) {
    node.on_input(|msg, send, _| async move {
        send.send(msg);
        Ok(())
    });
}

/// Receives `msg.error = {message, source}` for errors reported in its flow.
/// With `uncaught: true` it only gets errors no other catch node took.
pub struct CatchNodeFactory;

impl NodeFactory for CatchNodeFactory {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        forward(node);
        Ok(())
    }

    fn node_type(&self) -> &str {
        CATCH_TYPE
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Catches errors thrown by nodes in the same flow".to_string(),
            category: "common".to_string(),
            inputs: 0,
            outputs: 1,
        }
    }
}

/// Receives `msg.status = {fill, shape, text, source}` for status updates.
pub struct StatusNodeFactory;

impl NodeFactory for StatusNodeFactory {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        forward(node);
        Ok(())
    }

    fn node_type(&self) -> &str {
        STATUS_TYPE
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Reports status changes of nodes in the same flow".to_string(),
            category: "common".to_string(),
            inputs: 0,
            outputs: 1,
        }
    }
}
