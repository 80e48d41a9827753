//! Websocket dial target

use std::fmt;

/// A websocket server address with an explicit port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `wss` when true, `ws` otherwise
    pub secure: bool,
    /// Host as written in a URL (IPv6 hosts keep their brackets)
    pub host: String,
    pub port: u16,
    /// Path and query, always starting with `/`
    pub path: String,
}

impl Endpoint {
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// `host:port`, suitable for dialing
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, suitable for TLS server names
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme(), self.host, self.port, self.path)
    }
}
