use std::io;
use thiserror::Error;

/// Unified error type for the node agent
#[derive(Error, Debug)]
pub enum NodeError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed blocking-rule port specification
    #[error("Invalid port specification: {0}")]
    InvalidPort(String),

    /// Protocol kind that cannot be expressed as a listener or outbound
    #[error("Unsupported protocol: {0}")]
    Unsupported(String),

    /// Per-subscriber key derivation failure
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Topology spec construction error
    #[error("Topology build error: {0}")]
    Build(String),

    /// Live data plane rejected an apply/remove call
    #[error("Data plane error: {0}")]
    DataPlane(String),

    /// Remote panel error
    #[error("Panel API error: {0}")]
    Api(String),

    /// Certificate renewal error
    #[error("Certificate error: {0}")]
    Cert(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, NodeError>;

impl NodeError {
    /// Whether the error comes from building specs rather than applying them.
    pub fn is_build(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidPort(_)
                | NodeError::Unsupported(_)
                | NodeError::KeyDerivation(_)
                | NodeError::Build(_)
        )
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        NodeError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::Api(err.to_string())
    }
}
