//! Client configuration and its resolution into connection settings

use burrow_proto::{parse_auth, RemoteSet};
use burrow_transport_websocket::{DialStrategy, Endpoint, NetDial};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{ClientError, Result};

/// Default SSH keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(25);

/// Retry ceiling used when the configured one is below one second
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The validated websocket URL of the server
pub type ResolvedEndpoint = Endpoint;

/// Raw client configuration, immutable once the client is built
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `example.com`, `https://example.com:8443/tunnel`
    pub server: String,

    /// Expected prefix of the server key fingerprint (empty = accept any)
    #[serde(default)]
    pub fingerprint: String,

    /// `user:pass` credentials
    #[serde(default)]
    pub auth: String,

    /// SSH keep-alive interval (zero disables keep-alives)
    #[serde(with = "duration_secs", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Maximum number of retries (None = unbounded)
    #[serde(default)]
    pub max_retry_count: Option<u32>,

    /// Ceiling for the delay between retries
    #[serde(with = "duration_secs", default)]
    pub max_retry_interval: Duration,

    /// Outbound HTTP(S) or SOCKS5 proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// Remote specifications, e.g. `3000`, `R:2222:localhost:22`, `socks`
    #[serde(default)]
    pub remotes: Vec<String>,

    /// Extra headers for the websocket upgrade request
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    /// Skip TLS certificate verification (INSECURE)
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Custom low-level dial function, used when no proxy is configured
    #[serde(skip)]
    pub dial: Option<Arc<dyn NetDial>>,
}

fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            fingerprint: String::new(),
            auth: String::new(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            max_retry_count: None,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            proxy: None,
            remotes: Vec::new(),
            headers: Vec::new(),
            tls_skip_verify: false,
            dial: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("fingerprint", &self.fingerprint)
            .field("auth", &if self.auth.is_empty() { "" } else { "<redacted>" })
            .field("keep_alive", &self.keep_alive)
            .field("max_retry_count", &self.max_retry_count)
            .field("max_retry_interval", &self.max_retry_interval)
            .field("proxy", &self.proxy)
            .field("remotes", &self.remotes)
            .field("headers", &self.headers)
            .field("tls_skip_verify", &self.tls_skip_verify)
            .field("dial", &self.dial.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validate and normalize into connection settings
    pub fn resolve(&self) -> Result<Settings> {
        let endpoint = resolve_endpoint(&self.server)?;
        let remotes = RemoteSet::decode(&self.remotes)?;

        let proxy = match self.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(p) => Some(Url::parse(p).map_err(|e| ClientError::InvalidProxy(e.to_string()))?),
            None => None,
        };
        let strategy = DialStrategy::select(proxy.as_ref(), self.dial.clone())?;

        let headers = resolve_headers(&self.headers)?;
        let (user, password) = parse_auth(&self.auth);

        Ok(Settings {
            endpoint,
            remotes,
            proxy,
            strategy,
            headers,
            fingerprint: self.fingerprint.clone(),
            user,
            password,
            keep_alive: self.keep_alive,
            max_retry_count: self.max_retry_count,
            max_retry_interval: effective_retry_interval(self.max_retry_interval),
            tls_skip_verify: self.tls_skip_verify,
        })
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.config.server = server.into();
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.config.fingerprint = fingerprint.into();
        self
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.config.auth = auth.into();
        self
    }

    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.config.keep_alive = interval;
        self
    }

    pub fn max_retry_count(mut self, count: Option<u32>) -> Self {
        self.config.max_retry_count = count;
        self
    }

    pub fn max_retry_interval(mut self, interval: Duration) -> Self {
        self.config.max_retry_interval = interval;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn remote(mut self, remote: impl Into<String>) -> Self {
        self.config.remotes.push(remote.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.push((name.into(), value.into()));
        self
    }

    pub fn tls_skip_verify(mut self, skip: bool) -> Self {
        self.config.tls_skip_verify = skip;
        self
    }

    pub fn dial(mut self, dial: Arc<dyn NetDial>) -> Self {
        self.config.dial = Some(dial);
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        if self.config.server.is_empty() {
            return Err(ClientError::InvalidServer {
                url: String::new(),
                reason: "server is required".to_string(),
            });
        }
        Ok(self.config)
    }
}

/// Everything a connection attempt needs, derived once from [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: ResolvedEndpoint,
    pub remotes: RemoteSet,
    pub proxy: Option<Url>,
    pub strategy: DialStrategy,
    pub headers: HeaderMap,
    pub fingerprint: String,
    pub user: String,
    pub password: String,
    pub keep_alive: Duration,
    pub max_retry_count: Option<u32>,
    pub max_retry_interval: Duration,
    pub tls_skip_verify: bool,
}

/// Normalize a server address into a websocket endpoint with an explicit port
pub fn resolve_endpoint(server: &str) -> Result<ResolvedEndpoint> {
    let invalid = |reason: String| ClientError::InvalidServer {
        url: server.to_string(),
        reason,
    };

    let with_scheme = if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{}", server)
    };
    let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;

    let secure = match url.scheme() {
        "http" | "ws" => false,
        "https" | "wss" => true,
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?;
    let port = url.port().unwrap_or(if secure { 443 } else { 80 });

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(Endpoint {
        secure,
        host: host.to_string(),
        port,
        path,
    })
}

/// Retry ceilings below one second fall back to five minutes
pub fn effective_retry_interval(configured: Duration) -> Duration {
    if configured < Duration::from_secs(1) {
        DEFAULT_MAX_RETRY_INTERVAL
    } else {
        configured
    }
}

fn resolve_headers(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ClientError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ClientError::InvalidHeader(format!("{}: {}", name, value)))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Parse a `Name: value` header argument
pub fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| ClientError::InvalidHeader(header.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ClientError::InvalidHeader(header.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
