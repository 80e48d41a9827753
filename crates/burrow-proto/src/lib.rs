//! Burrow protocol definitions
//!
//! Shared vocabulary between the burrow client and server: remote descriptors,
//! the configuration payload exchanged during session negotiation, credential
//! parsing and host key fingerprints.

pub mod auth;
pub mod config;
pub mod fingerprint;
pub mod remote;

pub use auth::parse_auth;
pub use config::SessionConfig;
pub use fingerprint::fingerprint;
pub use remote::{Capabilities, L4Proto, Remote, RemoteSet};

use thiserror::Error;

/// Tunneling protocol version, also used as the websocket subprotocol token
pub const PROTOCOL_VERSION: &str = "burrow-v1";

/// Build version of this crate
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the control request carrying the session configuration
pub const CONFIG_REQUEST: &str = "config";

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Failed to decode remote '{spec}': {reason}")]
    InvalidRemote { spec: String, reason: String },

    #[error("Only one stdio is allowed")]
    DuplicateStdio,

    #[error("Invalid session config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

/// SSH client identification banner, e.g. `SSH-2.0-burrow-v1-client`.
/// Servers discard identification lines that do not start with `SSH-2.0-`.
pub fn client_banner() -> String {
    format!("SSH-2.0-{}-client", PROTOCOL_VERSION)
}
