//! Upgrade and TLS settings for outgoing websocket connections

use http::HeaderMap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_rustls::TlsConnector;

use crate::error::TransportResult;

/// Default bound on dialing plus the websocket upgrade
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// Settings applied to every upgrade a connector performs
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Subprotocol token sent as `Sec-WebSocket-Protocol`
    pub subprotocol: String,

    /// Bound on the whole dial: proxy, TLS and websocket upgrade
    pub handshake_timeout: Duration,

    /// Extra headers attached verbatim to the upgrade request
    pub headers: HeaderMap,

    /// Trust any server certificate
    pub tls_skip_verify: bool,
}

impl WebSocketConfig {
    /// 45 s timeout, no extra headers, verified TLS
    pub fn client_default(subprotocol: &str) -> Self {
        Self {
            subprotocol: subprotocol.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            headers: HeaderMap::new(),
            tls_skip_verify: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Trust any server certificate. Development only.
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.tls_skip_verify = skip;
        self
    }

    /// TLS connector shared by `wss://` servers and `https://` proxies
    pub(crate) fn build_tls(&self) -> TransportResult<TlsConnector> {
        install_ring_provider();

        let builder = ClientConfig::builder();
        let tls = if self.tls_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(tls)))
    }
}

static RING_PROVIDER: Once = Once::new();

/// rustls needs a process-wide provider before any config is built
fn install_ring_provider() {
    RING_PROVIDER.call_once(|| {
        if ring::default_provider().install_default().is_err() {
            tracing::debug!("rustls provider was installed elsewhere");
        }
    });
}

/// Accepts every server certificate. Only reachable through `--tls-skip-verify`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _leaf: &CertificateDer<'_>,
        _chain: &[CertificateDer<'_>],
        _name: &ServerName<'_>,
        _ocsp: &[u8],
        _at: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _signature: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _signature: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
