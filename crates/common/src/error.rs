use thiserror::Error;

/// Common error types for the relay mesh
#[derive(Debug, Error)]
pub enum RelayMeshError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("No exit node available")]
    NoExitNode,

    #[error("Connect timed out on {node}")]
    ConnectTimeout { node: String },

    #[error("Connect rejected by {node}: {reason}")]
    ConnectRejected { node: String, reason: String },

    #[error("Exit node already registered: {0}")]
    DuplicateNode(String),

    #[error("Exit node closed: {0}")]
    NodeClosed(String),

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for relay mesh operations
pub type Result<T> = std::result::Result<T, RelayMeshError>;

impl RelayMeshError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Whether the failure belongs to a single connect attempt and may be
    /// retried on another exit node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectRejected { .. }
                | Self::NodeClosed(_)
                | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_retryable() {
        assert!(RelayMeshError::ConnectTimeout { node: "a".into() }.is_retryable());
        assert!(RelayMeshError::NodeClosed("a".into()).is_retryable());
        assert!(!RelayMeshError::NoExitNode.is_retryable());
        assert!(!RelayMeshError::invalid_target("x").is_retryable());
    }
}
