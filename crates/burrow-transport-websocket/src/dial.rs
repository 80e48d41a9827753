//! Outbound dial strategies
//!
//! The strategy is chosen once from the optional proxy URL:
//!
//! - no proxy: dial directly (or through a caller supplied [`NetDial`])
//! - `socks://` / `socks5h://`: SOCKS5 CONNECT, resolving names at the proxy
//! - any other `socks*` scheme: rejected
//! - anything else: HTTP(S) forward proxy using `CONNECT`

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::error::{TransportError, TransportResult};

/// Largest CONNECT response header block we accept
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_AUTH_NONE: u8 = 0x00;
const SOCKS_AUTH_PASSWORD: u8 = 0x02;
const SOCKS_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

/// A bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Produce a network connection to `host:port`
#[async_trait]
pub trait NetDial: Send + Sync {
    async fn dial(&self, addr: &str) -> std::io::Result<BoxedStream>;
}

/// HTTP(S) forward proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Pre-encoded `Proxy-Authorization: Basic` credentials
    pub basic_auth: Option<String>,
}

/// SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Proxy {
    pub addr: String,
    pub auth: Option<(String, String)>,
}

/// How the raw transport connection is produced
#[derive(Clone)]
pub enum DialStrategy {
    Direct,
    Custom(Arc<dyn NetDial>),
    HttpConnect(HttpProxy),
    Socks5(Socks5Proxy),
}

impl fmt::Debug for DialStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialStrategy::Direct => f.write_str("Direct"),
            DialStrategy::Custom(_) => f.write_str("Custom"),
            DialStrategy::HttpConnect(proxy) => f.debug_tuple("HttpConnect").field(proxy).finish(),
            DialStrategy::Socks5(proxy) => f.debug_tuple("Socks5").field(proxy).finish(),
        }
    }
}

impl DialStrategy {
    /// Choose a strategy from the optional proxy URL. A configured proxy takes
    /// precedence over a custom dial function.
    pub fn select(proxy: Option<&Url>, custom: Option<Arc<dyn NetDial>>) -> TransportResult<Self> {
        let Some(url) = proxy else {
            return Ok(match custom {
                Some(dial) => DialStrategy::Custom(dial),
                None => DialStrategy::Direct,
            });
        };

        let scheme = url.scheme();
        let host = url.host_str().ok_or_else(|| {
            TransportError::ConfigurationError(format!("proxy URL has no host: {}", url))
        })?;
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };

        if !scheme.starts_with("socks") {
            let port = url.port_or_known_default().ok_or_else(|| {
                TransportError::ConfigurationError(format!("proxy URL has no port: {}", url))
            })?;
            return Ok(DialStrategy::HttpConnect(HttpProxy {
                secure: scheme == "https",
                host: host.to_string(),
                port,
                basic_auth: credentials
                    .map(|(user, pass)| STANDARD.encode(format!("{}:{}", user, pass))),
            }));
        }

        if scheme != "socks" && scheme != "socks5h" {
            return Err(TransportError::UnsupportedProxy(scheme.to_string()));
        }

        Ok(DialStrategy::Socks5(Socks5Proxy {
            addr: format!("{}:{}", host, url.port().unwrap_or(1080)),
            auth: credentials,
        }))
    }

    /// Open a connection to `addr` (`host:port`). `tls` is used to reach
    /// `https://` proxies.
    pub async fn connect(&self, addr: &str, tls: &TlsConnector) -> TransportResult<BoxedStream> {
        match self {
            DialStrategy::Direct => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            DialStrategy::Custom(dial) => Ok(dial.dial(addr).await?),
            DialStrategy::HttpConnect(proxy) => {
                debug!("Dialing {} via HTTP proxy {}:{}", addr, proxy.host, proxy.port);
                let stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
                stream.set_nodelay(true)?;
                let stream: BoxedStream = if proxy.secure {
                    let name = ServerName::try_from(proxy.host.clone()).map_err(|e| {
                        TransportError::TlsError(format!("Invalid proxy name: {}", e))
                    })?;
                    let tls_stream = tls.connect(name, stream).await.map_err(|e| {
                        TransportError::TlsError(format!("Proxy TLS handshake failed: {}", e))
                    })?;
                    Box::new(tls_stream)
                } else {
                    Box::new(stream)
                };
                http_connect(stream, addr, proxy.basic_auth.as_deref()).await
            }
            DialStrategy::Socks5(proxy) => {
                debug!("Dialing {} via SOCKS5 proxy {}", addr, proxy.addr);
                let stream = TcpStream::connect(proxy.addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let stream: BoxedStream = Box::new(stream);
                socks5_connect(stream, addr, proxy.auth.as_ref()).await
            }
        }
    }
}

/// Issue `CONNECT addr` on an established proxy connection
pub async fn http_connect<S>(mut stream: S, addr: &str, basic_auth: Option<&str>) -> TransportResult<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", addr, addr);
    if let Some(credentials) = basic_auth {
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte at a time so nothing past the header block is consumed
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_PROXY_RESPONSE {
            return Err(TransportError::ProxyError(
                "CONNECT response too large".to_string(),
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::ProxyError(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        buf.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf)
        .map_err(|e| TransportError::ProxyError(format!("invalid CONNECT response: {}", e)))?;

    match response.code {
        Some(200) => Ok(stream),
        Some(code) => Err(TransportError::ProxyError(format!(
            "proxy refused CONNECT: {} {}",
            code,
            response.reason.unwrap_or_default()
        ))),
        None => Err(TransportError::ProxyError(
            "incomplete CONNECT response".to_string(),
        )),
    }
}

/// Run the SOCKS5 greeting, optional RFC 1929 authentication and CONNECT
pub async fn socks5_connect<S>(
    mut stream: S,
    addr: &str,
    auth: Option<&(String, String)>,
) -> TransportResult<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_host_port(addr)?;

    let greeting: &[u8] = if auth.is_some() {
        &[SOCKS_VERSION, 2, SOCKS_AUTH_NONE, SOCKS_AUTH_PASSWORD]
    } else {
        &[SOCKS_VERSION, 1, SOCKS_AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(TransportError::ProxyError(format!(
            "unexpected SOCKS version {}",
            choice[0]
        )));
    }

    match (choice[1], auth) {
        (SOCKS_AUTH_NONE, _) => {}
        (SOCKS_AUTH_PASSWORD, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(TransportError::ProxyError(
                    "SOCKS credentials too long".to_string(),
                ));
            }
            let mut request = Vec::with_capacity(3 + user.len() + pass.len());
            request.push(0x01);
            request.push(user.len() as u8);
            request.extend_from_slice(user.as_bytes());
            request.push(pass.len() as u8);
            request.extend_from_slice(pass.as_bytes());
            stream.write_all(&request).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(TransportError::ProxyError(
                    "SOCKS authentication rejected".to_string(),
                ));
            }
        }
        (SOCKS_NO_ACCEPTABLE, _) => {
            return Err(TransportError::ProxyError(
                "no acceptable SOCKS authentication method".to_string(),
            ));
        }
        (method, _) => {
            return Err(TransportError::ProxyError(format!(
                "unsupported SOCKS authentication method {}",
                method
            )));
        }
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(SOCKS_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(TransportError::ProxyError(format!(
                    "host name too long: {}",
                    host
                )));
            }
            request.push(SOCKS_ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(TransportError::ProxyError(format!(
            "SOCKS connect failed: {}",
            socks_reply_message(reply[1])
        )));
    }

    // Skip the bound address and port
    let skip = match reply[3] {
        SOCKS_ATYP_IPV4 => 4 + 2,
        SOCKS_ATYP_IPV6 => 16 + 2,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(TransportError::ProxyError(format!(
                "unknown SOCKS address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

fn split_host_port(addr: &str) -> TransportResult<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        TransportError::ConfigurationError(format!("missing port in address {}", addr))
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        TransportError::ConfigurationError(format!("invalid port in address {}", addr))
    })?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

fn socks_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
