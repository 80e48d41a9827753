//! Outgoing websocket connections

use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info};

use crate::config::WebSocketConfig;
use crate::connection::WebSocketConn;
use crate::dial::{BoxedStream, DialStrategy};
use crate::endpoint::Endpoint;
use crate::error::{TransportError, TransportResult};

/// Dials a burrow server and performs the websocket upgrade
pub struct WebSocketConnector {
    tls: TlsConnector,
    strategy: DialStrategy,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>, strategy: DialStrategy) -> TransportResult<Self> {
        let tls = config.build_tls()?;

        debug!("WebSocket connector created ({:?})", strategy);

        Ok(Self {
            tls,
            strategy,
            config,
        })
    }

    /// Dial `endpoint` and upgrade to a websocket, all within the handshake
    /// timeout.
    pub async fn connect(&self, endpoint: &Endpoint) -> TransportResult<WebSocketConn<BoxedStream>> {
        let timeout = self.config.handshake_timeout;
        tokio::time::timeout(timeout, self.connect_inner(endpoint))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn connect_inner(&self, endpoint: &Endpoint) -> TransportResult<WebSocketConn<BoxedStream>> {
        debug!("Connecting to WebSocket server: {}", endpoint);

        let stream = self
            .strategy
            .connect(&endpoint.authority(), &self.tls)
            .await?;

        let stream: BoxedStream = if endpoint.secure {
            let name = ServerName::try_from(endpoint.server_name().to_string()).map_err(|e| {
                TransportError::TlsError(format!("bad server name {}: {}", endpoint.server_name(), e))
            })?;
            let secured = self
                .tls
                .connect(name, stream)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS with {} failed: {}", endpoint, e)))?;
            Box::new(secured)
        } else {
            stream
        };

        let mut request = endpoint
            .url()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("cannot build upgrade request: {}", e)))?;
        let subprotocol = HeaderValue::from_str(&self.config.subprotocol).map_err(|e| {
            TransportError::ConfigurationError(format!("bad subprotocol token: {}", e))
        })?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, subprotocol);
        for (name, value) in self.config.headers.iter() {
            request.headers_mut().append(name.clone(), value.clone());
        }

        let (ws_stream, response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| TransportError::HandshakeError(e.to_string()))?;

        let conn = WebSocketConn::new(ws_stream);
        info!(
            "WebSocket connection {} established to {} ({})",
            conn.connection_id(),
            endpoint,
            response.status()
        );

        Ok(conn)
    }
}
