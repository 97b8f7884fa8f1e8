use flowcontext::ContextError;
use flowcore::{ConfigError, FlowError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("Invalid flow configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Missing node types: {}", .0.join(", "))]
    MissingTypes(Vec<String>),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
