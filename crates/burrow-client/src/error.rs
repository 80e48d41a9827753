//! Client errors and their retry classification

use burrow_proto::ProtoError;
use burrow_transport_websocket::{is_permanent_io, TransportError};
use std::time::Duration;
use thiserror::Error;

use crate::tunnel::TunnelError;

/// What the reconnection loop should do about a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient, try again after backoff
    Retriable,
    /// Credentials or server identity rejected
    FatalAuth,
    /// Server refused our configuration, or the configuration is invalid
    FatalProtocol,
    /// Network failure that retrying cannot fix
    FatalNetwork,
    /// Shutdown was requested
    Cancelled,
}

impl Disposition {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Disposition::Retriable)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid server URL '{url}': {reason}")]
    InvalidServer { url: String, reason: String },

    #[error("Invalid proxy URL ({0})")]
    InvalidProxy(String),

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Invalid fingerprint ({0})")]
    FingerprintMismatch(String),

    #[error("Config verification failed: {0}")]
    ConfigSend(String),

    #[error("{0}")]
    ConfigRejected(String),

    #[error("Session error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Client already started")]
    AlreadyStarted,

    #[error("Client not started")]
    NotStarted,

    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// A failure already reported to another `wait` caller
    #[error("{message}")]
    Stopped {
        message: String,
        disposition: Disposition,
    },
}

impl ClientError {
    /// Classify this error for the reconnection loop
    pub fn disposition(&self) -> Disposition {
        match self {
            // The dial itself is always worth retrying
            ClientError::Transport(_) => Disposition::Retriable,
            ClientError::HandshakeTimeout(_) => Disposition::Retriable,
            ClientError::Ssh(russh::Error::IO(e)) if is_permanent_io(e) => {
                Disposition::FatalNetwork
            }
            ClientError::Ssh(_) => Disposition::Retriable,
            ClientError::AuthFailed | ClientError::FingerprintMismatch(_) => Disposition::FatalAuth,
            ClientError::ConfigSend(_) => Disposition::FatalNetwork,
            ClientError::ConfigRejected(_) => Disposition::FatalProtocol,
            ClientError::Tunnel(e) if e.is_permanent() => Disposition::FatalNetwork,
            ClientError::Tunnel(_) => Disposition::Retriable,
            ClientError::Cancelled => Disposition::Cancelled,
            ClientError::Stopped { disposition, .. } => *disposition,
            ClientError::InvalidServer { .. }
            | ClientError::InvalidProxy(_)
            | ClientError::InvalidHeader(_)
            | ClientError::Proto(_)
            | ClientError::AlreadyStarted
            | ClientError::NotStarted
            | ClientError::TaskFailed(_) => Disposition::FatalProtocol,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
