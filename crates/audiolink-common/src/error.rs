use thiserror::Error;

use crate::config::NodeId;

#[derive(Error, Debug)]
pub enum AudiolinkError {
    #[error("Invalid node configuration: {0}")]
    InvalidNodeConfig(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication rejected by node {0}")]
    Unauthorized(String),

    #[error("Unsupported node version: {0}")]
    UnsupportedVersion(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Duplicate node identifier: {0}")]
    DuplicateNode(NodeId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node is closed")]
    NodeClosed,

    #[error("Config store error: {0}")]
    ConfigStore(String),

    #[error("Failed to initialize the outbound session: {0}")]
    SessionInit(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudiolinkError>;
