//! Transport-level errors

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("WebSocket handshake failed: {0}")]
    HandshakeError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("unsupported socks proxy type: {0}:// (only socks5h:// or socks:// is supported)")]
    UnsupportedProxy(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Whether an I/O error is permanent, i.e. retrying the same operation cannot
/// succeed without outside intervention. Everything not listed is transient.
pub fn is_permanent_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::Unsupported
    )
}
