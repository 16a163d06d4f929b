//! Transport error taxonomy

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
