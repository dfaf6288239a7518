//! Error types for resource-server transfers.

use irods_protocol::ProtocolError;
use irods_transfer::TransferError;

/// Errors produced while streaming through a resource server.
#[derive(Debug, thiserror::Error)]
pub enum ResourceServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid redirection: {0}")]
    InvalidRedirection(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("stream task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<ProtocolError> for ResourceServerError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidRedirection(msg) => ResourceServerError::InvalidRedirection(msg),
            ProtocolError::UnknownAlgorithm(name) => ResourceServerError::Unsupported(name),
            other => ResourceServerError::Protocol(other.to_string()),
        }
    }
}
