use thiserror::Error;

/// Errors raised at the construction, probe and configuration boundaries.
///
/// Placement queries never return these: an empty result is the failure signal
/// on the request path.
#[derive(Error, Debug)]
pub enum ShardlineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Fault domain not found: {0}")]
    DomainNotFound(String),

    #[error("Failed to build client for node {node}: {reason}")]
    ClientBuild { node: String, reason: String },

    #[error("Probe failed for node {node}: {reason}")]
    Probe { node: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ShardlineError>;
