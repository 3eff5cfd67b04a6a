use thiserror::Error;

use crate::types::DocumentKey;

#[derive(Error, Debug)]
pub enum ModelGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Host read failed: {0}")]
    Host(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Document not tracked: {0}")]
    NotTracked(DocumentKey),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config_manager::ConfigError),
}

pub type Result<T> = std::result::Result<T, ModelGraphError>;

/// Error surfaced by a single host read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

impl From<HostError> for ModelGraphError {
    fn from(err: HostError) -> Self {
        ModelGraphError::Host(err.0)
    }
}
