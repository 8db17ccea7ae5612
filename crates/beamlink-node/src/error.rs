//! Node-level errors.

use beamlink_crypto::CryptoError;
use beamlink_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("no connection to {0}")]
    NoConnection(String),
    #[error("name {0} is already registered")]
    NameTaken(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl From<CryptoError> for NodeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::IoError(e) => NodeError::Io(e),
            other => NodeError::Config(other.to_string()),
        }
    }
}

impl NodeError {
    /// True for failures where retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Connection(_) | NodeError::Timeout(_) | NodeError::NoConnection(_)
        )
    }
}
