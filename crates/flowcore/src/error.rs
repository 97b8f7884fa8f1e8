use flowcontext::ContextError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Failed to create node '{id}': {source}")]
    NodeCreation {
        id: String,
        #[source]
        source: NodeError,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow is stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("{0}")]
    Failed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Context error: {0}")]
    Context(#[from] ContextError),
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Flow configuration must be a JSON array of objects")]
    NotAnArray,

    #[error("Entry {index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("Entry {index} is invalid: {message}")]
    InvalidEntry { index: usize, message: String },

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Node '{node}' belongs to unknown flow '{flow}'")]
    UnknownFlow { node: String, flow: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::InvalidJson(e.to_string())
    }
}
