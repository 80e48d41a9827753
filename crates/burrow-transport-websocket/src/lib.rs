//! WebSocket transport for the burrow client
//!
//! Dials the burrow server over `ws://` or `wss://`, optionally through an
//! outbound HTTP CONNECT or SOCKS5 proxy, and exposes the resulting websocket
//! as a plain byte stream so a secure session can be layered on top of it.
//!
//! ```text
//! DialStrategy ──► [TLS] ──► websocket handshake ──► WebSocketConn (AsyncRead + AsyncWrite)
//! ```
//!
//! Every binary websocket message carries an opaque slice of the byte stream;
//! message boundaries carry no meaning.

pub mod config;
pub mod connection;
pub mod connector;
pub mod dial;
pub mod endpoint;
pub mod error;

pub use config::WebSocketConfig;
pub use connection::WebSocketConn;
pub use connector::WebSocketConnector;
pub use dial::{AsyncStream, BoxedStream, DialStrategy, HttpProxy, NetDial, Socks5Proxy};
pub use endpoint::Endpoint;
pub use error::{is_permanent_io, TransportError, TransportResult};
