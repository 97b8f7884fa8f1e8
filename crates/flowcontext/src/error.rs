use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("Invalid context key")]
    InvalidKey,

    #[error("Invalid property expression: {0}")]
    InvalidExpression(String),

    #[error("Invalid context store name: {0}")]
    InvalidStoreName(String),

    #[error("Invalid default context store: {0}")]
    InvalidDefaultStore(String),

    #[error("Context store '{0}' does not define a module")]
    ModuleNotDefined(String),

    #[error("Error loading context store '{module}': {message}")]
    LoadFailed { module: String, message: String },

    #[error("Context store '{0}' does not support synchronous access")]
    SyncUnsupported(String),

    #[error("Context store I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ContextError {
    pub fn load_failed(module: impl Into<String>, message: impl ToString) -> Self {
        Self::LoadFailed {
            module: module.into(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for ContextError {
    fn from(e: std::io::Error) -> Self {
        ContextError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(e: serde_json::Error) -> Self {
        ContextError::Serialization(e.to_string())
    }
}
