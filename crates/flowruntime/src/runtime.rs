use crate::flow::{ActiveFlow, NODES_STARTED};
use crate::registry::NodeRegistry;
use crate::RuntimeError;
use chrono::Utc;
use flowcontext::{ContextManager, ContextSettings};
use flowcore::{EventBus, FlowConfig, FlowId, Hooks, Message, Node, NodeEnv, NodeId, NodeSpec, RuntimeEvent};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Main runtime: deploys flow configurations and keeps them running.
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    contexts: Arc<ContextManager>,
    hooks: Arc<Hooks>,
    event_bus: Arc<EventBus>,
    state: RwLock<Deployment>,
}

#[derive(Default)]
struct Deployment {
    config: FlowConfig,
    /// Specs of the nodes that are running, by id.
    nodes: HashMap<NodeId, NodeSpec>,
    flows: HashMap<FlowId, Arc<ActiveFlow>>,
}

impl Deployment {
    fn running(&self, spec: &NodeSpec) -> Option<Arc<Node>> {
        spec.z
            .as_deref()
            .and_then(|z| self.flows.get(z))
            .and_then(|flow| flow.node(&spec.id))
    }

    fn take(&self, spec: &NodeSpec) -> Option<Arc<Node>> {
        spec.z
            .as_deref()
            .and_then(|z| self.flows.get(z))
            .and_then(|flow| flow.remove_node(&spec.id))
    }
}

/// What a deploy changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploySummary {
    pub added: Vec<NodeId>,
    /// Recreated because their configuration changed.
    pub changed: Vec<NodeId>,
    /// Kept running with new wiring.
    pub rewired: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Nodes whose type refused their configuration, with the reason.
    pub failed: Vec<(NodeId, String)>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            contexts: Arc::new(ContextManager::new(config.context)),
            hooks: Arc::new(Hooks::new()),
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            state: RwLock::new(Deployment::default()),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// Message hooks shared by every node this runtime creates.
    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Open the configured context stores. Call once before the first deploy.
    pub async fn load(&self) -> Result<(), RuntimeError> {
        self.contexts.load().await?;
        let listing = self.contexts.list_stores();
        tracing::info!("Context stores: {:?} (default {})", listing.stores, listing.default);
        Ok(())
    }

    /// Bring the running flows in line with `config`.
    ///
    /// Removed nodes are closed with `removed = true`. Nodes whose
    /// configuration changed are closed and recreated. Nodes whose wiring
    /// alone changed keep running with the new wiring. Everything else is
    /// left alone.
    pub async fn deploy(&self, config: FlowConfig) -> Result<DeploySummary, RuntimeError> {
        config.validate()?;
        let desired: HashMap<NodeId, NodeSpec> = runnable(&config)
            .map(|spec| (spec.id.clone(), spec.clone()))
            .collect();

        let missing: BTreeSet<&str> = desired
            .values()
            .map(|spec| spec.node_type.as_str())
            .filter(|t| !self.registry.contains(t))
            .collect();
        if !missing.is_empty() {
            return Err(RuntimeError::MissingTypes(missing.into_iter().map(String::from).collect()));
        }

        let mut state = self.state.write().await;
        let mut summary = DeploySummary::default();
        let mut closing = Vec::new();
        let mut create = Vec::new();

        for (id, old) in &state.nodes {
            match desired.get(id) {
                None => {
                    summary.removed.push(id.clone());
                    closing.push((state.take(old), true));
                }
                Some(new) if new == old => {}
                Some(new) if new.same_except_wires(old) => {
                    if let Some(node) = state.running(old) {
                        node.update_wires(new.wires.clone());
                    }
                    summary.rewired.push(id.clone());
                }
                Some(new) => {
                    summary.changed.push(id.clone());
                    closing.push((state.take(old), false));
                    create.push(new.clone());
                }
            }
        }
        for (id, spec) in &desired {
            if !state.nodes.contains_key(id) {
                summary.added.push(id.clone());
                create.push(spec.clone());
            }
        }

        join_all(
            closing
                .into_iter()
                .filter_map(|(node, removed)| node.map(|node| async move { node.close(removed).await })),
        )
        .await;

        let wanted_flows: BTreeSet<&str> = desired.values().filter_map(|spec| spec.z.as_deref()).collect();
        let stale: Vec<FlowId> = state
            .flows
            .keys()
            .filter(|id| !wanted_flows.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(flow) = state.flows.remove(&id) {
                flow.stop(true).await;
            }
        }

        create.sort_by(|a, b| a.id.cmp(&b.id));
        let mut started = Vec::new();
        for spec in create {
            let Some(flow_id) = spec.z.clone() else { continue };
            let flow = state
                .flows
                .entry(flow_id.clone())
                .or_insert_with(|| ActiveFlow::start(flow_id, &self.event_bus))
                .clone();
            let env = NodeEnv::new(flow.handle(), self.contexts.clone()).with_hooks(self.hooks.clone());
            match self.registry.create_node(&spec, env) {
                Ok(node) => {
                    flow.add_node(node.clone());
                    started.push(node);
                }
                Err(e) => {
                    tracing::error!("Failed to start node {} ({}): {}", spec.id, spec.node_type, e);
                    summary.failed.push((spec.id.clone(), e.to_string()));
                }
            }
        }

        state.nodes = desired;
        for (id, _) in &summary.failed {
            state.nodes.remove(id);
        }
        state.config = config;

        if let Err(e) = self.contexts.clean(&state.config.all_ids()).await {
            tracing::warn!("Failed to clean up contexts: {}", e);
        }

        for node in &started {
            node.events().emit(NODES_STARTED, &Value::Null);
        }

        let mut flow_ids: Vec<String> = state.flows.keys().cloned().collect();
        flow_ids.sort();
        self.event_bus.emit(RuntimeEvent::FlowsStarted {
            flow_ids,
            timestamp: Utc::now(),
        });
        for list in [&mut summary.added, &mut summary.changed, &mut summary.rewired, &mut summary.removed] {
            list.sort();
        }
        tracing::info!(
            "Deployed: {} added, {} changed, {} rewired, {} removed, {} failed",
            summary.added.len(),
            summary.changed.len(),
            summary.rewired.len(),
            summary.removed.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Stop every flow and close its nodes. The runtime can be deployed to
    /// again afterwards.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        let flows: Vec<Arc<ActiveFlow>> = state.flows.drain().map(|(_, flow)| flow).collect();
        join_all(flows.iter().map(|flow| flow.stop(false))).await;
        state.nodes.clear();
        state.config = FlowConfig::default();
        self.event_bus.emit(RuntimeEvent::FlowsStopped { timestamp: Utc::now() });
        tracing::info!("Stopped {} flows", flows.len());
    }

    /// Stop everything and close the context stores.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        self.stop().await;
        self.contexts.close().await?;
        Ok(())
    }

    /// The configuration last deployed.
    pub async fn config(&self) -> FlowConfig {
        self.state.read().await.config.clone()
    }

    pub async fn flow_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.state.read().await.flows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn node(&self, id: &str) -> Option<Arc<Node>> {
        let state = self.state.read().await;
        state.nodes.get(id).and_then(|spec| state.running(spec))
    }

    /// Queue a message for a running node.
    pub async fn inject(&self, node_id: &str, msg: Message) -> Result<(), RuntimeError> {
        let state = self.state.read().await;
        let flow = state
            .nodes
            .get(node_id)
            .and_then(|spec| spec.z.as_deref())
            .and_then(|z| state.flows.get(z))
            .ok_or_else(|| flowcore::FlowError::NodeNotFound(node_id.to_string()))?;
        flow.inject(node_id, msg)?;
        Ok(())
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Nodes that run: enabled, inside an enabled tab. Subflow definitions and
/// config nodes outside any tab are not started.
fn runnable(config: &FlowConfig) -> impl Iterator<Item = &NodeSpec> {
    config.nodes.iter().filter(move |spec| {
        if spec.disabled {
            return false;
        }
        if spec.node_type.starts_with("subflow:") {
            tracing::warn!("Node {}: subflow instances are not supported", spec.id);
            return false;
        }
        match spec.z.as_deref().and_then(|z| config.flow(z)) {
            Some(flow) => !flow.is_subflow() && !flow.disabled,
            None => {
                tracing::debug!("Skipping node {} ({}) outside any flow", spec.id, spec.node_type);
                false
            }
        }
    })
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    pub context: ContextSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            context: ContextSettings::default(),
        }
    }
}
