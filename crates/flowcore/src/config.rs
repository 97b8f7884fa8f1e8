//! Flow configuration: the flat JSON array of tab, subflow and node entries.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub type NodeId = String;
pub type FlowId = String;

/// Construction input for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Owning flow. Config nodes at the top level have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<FlowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "_alias", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub wires: Vec<Vec<NodeId>>,
    /// Disabled nodes are not started.
    #[serde(rename = "d", default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Type-specific properties.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            z: None,
            name: None,
            alias: None,
            wires: Vec::new(),
            disabled: false,
            properties: Map::new(),
        }
    }

    pub fn in_flow(mut self, flow: impl Into<String>) -> Self {
        self.z = Some(flow.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_wires<I, W, S>(mut self, wires: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wires = wires
            .into_iter()
            .map(|port| port.into_iter().map(Into::into).collect())
            .collect();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(Value::as_str)
    }

    /// Equal in everything but wiring.
    pub fn same_except_wires(&self, other: &NodeSpec) -> bool {
        self.id == other.id
            && self.node_type == other.node_type
            && self.z == other.z
            && self.name == other.name
            && self.alias == other.alias
            && self.disabled == other.disabled
            && self.properties == other.properties
    }
}

/// A tab (`type: "tab"`) or subflow definition (`type: "subflow"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub id: FlowId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl FlowSpec {
    pub fn tab(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "tab".to_string(),
            label: None,
            disabled: false,
            properties: Map::new(),
        }
    }

    pub fn is_subflow(&self) -> bool {
        self.kind == "subflow"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub flows: Vec<FlowSpec>,
    pub nodes: Vec<NodeSpec>,
}

impl FlowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Read the flat array form and check it.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Array(entries) = value else {
            return Err(ConfigError::NotAnArray);
        };
        let mut config = Self::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let Value::Object(obj) = entry else {
                return Err(ConfigError::NotAnArray);
            };
            for field in ["id", "type"] {
                if !obj.get(field).is_some_and(Value::is_string) {
                    return Err(ConfigError::MissingField { index, field });
                }
            }
            let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
            let invalid = |e: serde_json::Error| ConfigError::InvalidEntry {
                index,
                message: e.to_string(),
            };
            if kind == "tab" || kind == "subflow" {
                config
                    .flows
                    .push(serde_json::from_value(Value::Object(obj)).map_err(invalid)?);
            } else {
                config
                    .nodes
                    .push(serde_json::from_value(Value::Object(obj)).map_err(invalid)?);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// The flat array form.
    pub fn to_value(&self) -> Result<Value, ConfigError> {
        let mut entries = Vec::with_capacity(self.flows.len() + self.nodes.len());
        for flow in &self.flows {
            entries.push(serde_json::to_value(flow)?);
        }
        for node in &self.nodes {
            entries.push(serde_json::to_value(node)?);
        }
        Ok(Value::Array(entries))
    }

    pub fn with_flow(mut self, flow: FlowSpec) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Ids must be unique and nodes may only live in declared flows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let flow_ids = self.flows.iter().map(|f| f.id.as_str());
        let node_ids = self.nodes.iter().map(|n| n.id.as_str());
        for id in flow_ids.chain(node_ids) {
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateId(id.to_string()));
            }
        }
        for node in &self.nodes {
            if let Some(z) = &node.z {
                if self.flow(z).is_none() {
                    return Err(ConfigError::UnknownFlow {
                        node: node.id.clone(),
                        flow: z.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Wires pointing at ids that are not nodes: `(source, target)` pairs.
    pub fn dangling_wires(&self) -> Vec<(NodeId, NodeId)> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.nodes
            .iter()
            .flat_map(|n| n.wires.iter().flatten().map(move |target| (n, target)))
            .filter(|(_, target)| !ids.contains(target.as_str()))
            .map(|(n, target)| (n.id.clone(), target.clone()))
            .collect()
    }

    /// Every flow and node id, the set contexts are cleaned against.
    pub fn all_ids(&self) -> Vec<String> {
        self.flows
            .iter()
            .map(|f| f.id.clone())
            .chain(self.nodes.iter().map(|n| n.id.clone()))
            .collect()
    }

    pub fn flow(&self, id: &str) -> Option<&FlowSpec> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes_in<'a>(&'a self, flow_id: &'a str) -> impl Iterator<Item = &'a NodeSpec> + 'a {
        self.nodes.iter().filter(move |n| n.z.as_deref() == Some(flow_id))
    }

    /// Top-level tabs, subflow definitions excluded.
    pub fn tabs(&self) -> impl Iterator<Item = &FlowSpec> {
        self.flows.iter().filter(|f| !f.is_subflow())
    }
}
