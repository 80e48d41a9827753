//! Remote descriptors
//!
//! A remote describes one tunnel endpoint mapping. The textual form is
//!
//! ```text
//! [R:][local-host:][local-port:]remote-host:remote-port[/proto]
//! ```
//!
//! with `socks` allowed as the final segment and `stdio` as the first one.
//! Examples:
//!
//! - `3000` → `0.0.0.0:3000=>127.0.0.1:3000`
//! - `example.com:3000` → `0.0.0.0:3000=>example.com:3000`
//! - `3000:google.com:80` → `0.0.0.0:3000=>google.com:80`
//! - `R:2222:localhost:22` → reverse, server listens on 2222
//! - `socks` → `127.0.0.1:1080=>socks`
//! - `stdio:example.com:22` → local stdin/stdout
//! - `1.1.1.1:53/udp`

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::ProtoError;

const REVERSE_PREFIX: &str = "R:";

/// Layer 4 protocol carried by a remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    #[default]
    Tcp,
    Udp,
}

/// One parsed tunnel endpoint mapping
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Remote {
    pub local_host: String,
    pub local_port: Option<u16>,
    pub local_proto: L4Proto,
    pub remote_host: String,
    pub remote_port: Option<u16>,
    pub remote_proto: L4Proto,
    pub socks: bool,
    pub reverse: bool,
    pub stdio: bool,
}

impl Remote {
    /// Decode a single remote specification
    pub fn decode(spec: &str) -> Result<Self, ProtoError> {
        let invalid = |reason: &str| ProtoError::InvalidRemote {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (body, reverse) = match spec.strip_prefix(REVERSE_PREFIX) {
            Some(rest) => (rest, true),
            None => (spec, false),
        };

        let parts = split_segments(body).map_err(|reason| invalid(reason))?;
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid("Invalid remote"));
        }

        let mut remote = Remote {
            reverse,
            ..Default::default()
        };
        let mut remote_proto = None;
        let mut local_proto = None;

        // Walk back to front so the remote side is filled first and can
        // provide defaults for the local side.
        let last = parts.len() - 1;
        for (i, part) in parts.iter().enumerate().rev() {
            if i == last && *part == "socks" {
                remote.socks = true;
                continue;
            }
            if i == 0 && *part == "stdio" {
                remote.stdio = true;
                continue;
            }

            let (part, proto) = split_proto(part);
            if let Some(proto) = proto {
                if remote.remote_port.is_none() {
                    remote_proto = Some(proto);
                } else if local_proto.is_none() {
                    local_proto = Some(proto);
                }
            }

            if let Some(port) = parse_port(&part) {
                if !remote.socks && remote.remote_port.is_none() {
                    remote.remote_port = Some(port);
                }
                remote.local_port = Some(port);
                continue;
            }

            if !remote.socks && remote.remote_port.is_none() && remote.local_port.is_none() {
                return Err(invalid("Missing ports"));
            }
            if !is_host(&part) {
                return Err(invalid("Invalid host"));
            }
            if !remote.socks && remote.remote_host.is_empty() {
                remote.remote_host = part;
            } else {
                remote.local_host = part;
            }
        }

        if remote.socks {
            if remote.local_host.is_empty() {
                remote.local_host = "127.0.0.1".to_string();
            }
            if remote.local_port.is_none() {
                remote.local_port = Some(1080);
            }
        } else {
            if remote.local_host.is_empty() {
                remote.local_host = "0.0.0.0".to_string();
            }
            if remote.remote_host.is_empty() {
                remote.remote_host = "127.0.0.1".to_string();
            }
        }

        remote.remote_proto = remote_proto.unwrap_or_default();
        remote.local_proto = local_proto.unwrap_or(remote.remote_proto);

        if remote.local_proto != remote.remote_proto {
            return Err(invalid("cross-protocol remotes are not supported yet"));
        }
        if remote.socks && remote.remote_proto != L4Proto::Tcp {
            return Err(invalid("only TCP SOCKS is supported"));
        }
        if remote.stdio && remote.reverse {
            return Err(invalid("stdio cannot be reversed"));
        }

        Ok(remote)
    }

    /// Local side as `host:port`, or `stdio`
    pub fn local(&self) -> String {
        if self.stdio {
            return "stdio".to_string();
        }
        format!("{}:{}", self.local_host, port_str(self.local_port))
    }

    /// Remote side as `host:port`, or `socks`
    pub fn remote(&self) -> String {
        if self.socks {
            return "socks".to_string();
        }
        format!("{}:{}", self.remote_host, port_str(self.remote_port))
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            f.write_str(REVERSE_PREFIX)?;
        }
        let local = self.local();
        let remote = self.remote();
        write!(
            f,
            "{}=>{}",
            local.strip_prefix("0.0.0.0:").unwrap_or(&local),
            remote.strip_prefix("127.0.0.1:").unwrap_or(&remote)
        )?;
        if self.remote_proto == L4Proto::Udp {
            f.write_str("/udp")?;
        }
        Ok(())
    }
}

/// Capability summary of a remote set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub has_reverse: bool,
    pub has_socks: bool,
    pub has_stdio: bool,
}

impl Capabilities {
    /// The client always accepts inbound channels
    pub fn inbound(&self) -> bool {
        true
    }

    /// Outbound connections are only made for reverse remotes
    pub fn outbound(&self) -> bool {
        self.has_reverse
    }

    /// SOCKS is served locally only for reverse socks remotes
    pub fn socks(&self) -> bool {
        self.has_reverse && self.has_socks
    }
}

/// Ordered, immutable set of remotes with at most one stdio remote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSet {
    remotes: Vec<Remote>,
    capabilities: Capabilities,
}

impl RemoteSet {
    /// Decode every spec; the first failure aborts the whole set
    pub fn decode<I, S>(specs: I) -> Result<Self, ProtoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut remotes = Vec::new();
        let mut capabilities = Capabilities::default();

        for spec in specs {
            let remote = Remote::decode(spec.as_ref())?;
            if remote.socks {
                capabilities.has_socks = true;
            }
            if remote.reverse {
                capabilities.has_reverse = true;
            }
            if remote.stdio {
                if capabilities.has_stdio {
                    return Err(ProtoError::DuplicateStdio);
                }
                capabilities.has_stdio = true;
            }
            debug!("Decoded remote {}", remote);
            remotes.push(remote);
        }

        Ok(Self {
            remotes,
            capabilities,
        })
    }

    /// Remotes whose reverse flag equals `reverse`
    pub fn reversed(&self, reverse: bool) -> Vec<Remote> {
        self.remotes
            .iter()
            .filter(|r| r.reverse == reverse)
            .cloned()
            .collect()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn as_slice(&self) -> &[Remote] {
        &self.remotes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Remote> {
        self.remotes.iter()
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}

/// Split on `:` while keeping bracketed IPv6 hosts intact
fn split_segments(s: &str) -> Result<Vec<&str>, &'static str> {
    let mut parts = Vec::new();
    let mut rest = s;

    while !rest.is_empty() {
        let end = if rest.starts_with('[') {
            rest.find(']').map(|i| i + 1).ok_or("Invalid host")?
        } else {
            rest.find(':').unwrap_or(rest.len())
        };
        let (part, tail) = rest.split_at(end);
        if part.is_empty() {
            return Err("Invalid remote");
        }
        parts.push(part);
        rest = tail.strip_prefix(':').unwrap_or(tail);
    }

    Ok(parts)
}

/// Strip a trailing `/tcp` or `/udp`, case-insensitively
fn split_proto(part: &str) -> (String, Option<L4Proto>) {
    if let Some((head, proto)) = part.rsplit_once('/') {
        match proto.to_ascii_lowercase().as_str() {
            "tcp" => return (head.to_ascii_lowercase(), Some(L4Proto::Tcp)),
            "udp" => return (head.to_ascii_lowercase(), Some(L4Proto::Udp)),
            _ => {}
        }
    }
    (part.to_string(), None)
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

fn is_host(s: &str) -> bool {
    !s.is_empty() && url::Host::parse(s).is_ok()
}

fn port_str(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_default()
}
