//! Error types for quidnode

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Payment id text that is not exactly 64 hex characters.
    #[error("Payment id has invalid format: \"{0}\", expected 64-character string")]
    InvalidPaymentId(String),
    /// A record does not fit the extra field format limits.
    #[error("Encoding error: {0}")]
    EncodingError(String),
    /// Malformed or truncated extra field.
    #[error("Can't parse extra: {0}")]
    ParseError(String),
    /// Bootstrap of the node failed. Details are logged, not carried.
    #[error("Object was not initialized")]
    NotInitialized,
    #[error("Object is already initialized")]
    AlreadyInitialized,
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::IoError(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::ProtocolError(err.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::NetworkError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;
