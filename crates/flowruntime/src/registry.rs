use flowcore::{FlowError, Node, NodeEnv, NodeError, NodeSpec};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for node types.
///
/// The runtime constructs the [`Node`] itself; a factory attaches the
/// behaviour of its type by registering input and close handlers on it.
pub trait NodeFactory: Send + Sync {
    /// Set up a freshly constructed node of this type.
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: usize,
    pub outputs: usize,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: 1,
            outputs: 1,
        }
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Build a node from its spec and hand it to its type's factory.
    pub fn create_node(&self, spec: &NodeSpec, env: NodeEnv) -> Result<Arc<Node>, FlowError> {
        let factory = self
            .factories
            .get(&spec.node_type)
            .ok_or_else(|| FlowError::UnknownNodeType(spec.node_type.clone()))?;

        let node = Node::new(spec, env);
        factory.create(&node).map_err(|source| FlowError::NodeCreation {
            id: spec.id.clone(),
            source,
        })?;
        Ok(node)
    }

    /// Registered node types, sorted.
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcontext::ContextManager;
    use flowcore::testing::RecordingFlow;
    use flowcore::InputState;

    struct Echo;

    impl NodeFactory for Echo {
        fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
            node.on_input(|msg, send, _| async move {
                send.send(msg);
                Ok(())
            });
            Ok(())
        }

        fn node_type(&self) -> &str {
            "echo"
        }
    }

    struct Broken;

    impl NodeFactory for Broken {
        fn create(&self, _node: &Arc<Node>) -> Result<(), NodeError> {
            Err(NodeError::config("missing property"))
        }

        fn node_type(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn creates_registered_types() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Broken));
        assert_eq!(registry.list_node_types(), vec!["broken", "echo"]);

        let flow = RecordingFlow::new();
        let env = flow.env(Arc::new(ContextManager::default()));
        let node = registry.create_node(&NodeSpec::new("n1", "echo"), env.clone()).unwrap();
        assert_eq!(node.input_state(), InputState::Single);

        let err = registry.create_node(&NodeSpec::new("n2", "nope"), env.clone()).unwrap_err();
        assert!(matches!(err, FlowError::UnknownNodeType(t) if t == "nope"));

        let err = registry.create_node(&NodeSpec::new("n3", "broken"), env).unwrap_err();
        assert!(matches!(err, FlowError::NodeCreation { id, .. } if id == "n3"));
    }
}
