//! Burrow tunnel client
//!
//! Connects to a burrow server over a websocket, upgrades the connection to an
//! SSH session, negotiates the configured remotes and keeps the session alive
//! across network failures with exponential backoff.
//!
//! ```text
//! Client ──► ConnectionLoop ──► handshake ──► negotiate ──► SessionProcessor
//!    └─────► ListenerBinder (local sockets, once per client)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use burrow_client::{CancellationToken, Client, ClientConfig};
//!
//! # async fn example() -> Result<(), burrow_client::ClientError> {
//! let config = ClientConfig::builder()
//!     .server("https://tunnel.example.com")
//!     .auth("user:secret")
//!     .remote("3000")
//!     .build()?;
//!
//! let client = Client::new(&config)?;
//! client.run(&CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
mod connection_loop;
pub mod error;
pub mod handshake;
pub mod negotiate;
pub mod tunnel;

pub use backoff::Backoff;
pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder, ResolvedEndpoint, Settings};
pub use error::{ClientError, Disposition};
pub use handshake::{ControlEvent, InboundChannel, SecureConnection, SessionHandle};
pub use tunnel::{ListenerBinder, SessionProcessor, Tunnel, TunnelError};

// Re-export the pieces embedders need to configure dialing and remotes
pub use burrow_proto::{Remote, RemoteSet};
pub use burrow_transport_websocket::{BoxedStream, NetDial};
pub use tokio_util::sync::CancellationToken;
