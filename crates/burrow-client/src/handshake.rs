//! Secure session handshake over the websocket transport

use async_trait::async_trait;
use burrow_proto::{client_banner, fingerprint};
use burrow_transport_websocket::WebSocketConnector;
use russh::client;
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::Settings;
use crate::error::{ClientError, Result};

/// Bound on the SSH key exchange plus authentication
pub const SSH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unanswered keep-alives before the session is considered dead
const KEEPALIVE_MAX: usize = 3;

/// An authenticated SSH connection to the server
pub type SecureConnection = client::Handle<ClientHandler>;

/// Channel opened by the server towards the client
pub enum InboundChannel {
    ForwardedTcpip {
        channel: Channel<client::Msg>,
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
}

impl std::fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundChannel::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
                ..
            } => write!(
                f,
                "forwarded-tcpip {}:{} from {}:{}",
                connected_address, connected_port, originator_address, originator_port
            ),
        }
    }
}

/// Out-of-band notifications raised by the session
#[derive(Debug)]
pub enum ControlEvent {
    ChannelEof(ChannelId),
    ChannelClosed(ChannelId),
    /// The session failed. Sent once, right before both streams close.
    Failed(io::Error),
}

/// Carry a session failure across the side channel. I/O errors keep their
/// kind so permanence can still be judged; protocol-level failures such as a
/// keep-alive timeout are reported as transient.
fn failure_event(err: &russh::Error) -> ControlEvent {
    let kind = match err {
        russh::Error::IO(e) => e.kind(),
        russh::Error::KeepaliveTimeout | russh::Error::InactivityTimeout => {
            io::ErrorKind::TimedOut
        }
        _ => io::ErrorKind::ConnectionAborted,
    };
    ControlEvent::Failed(io::Error::new(kind, err.to_string()))
}

/// A live secure session, valid for one connection attempt
pub struct SessionHandle {
    pub connection: Arc<SecureConnection>,
    /// Side-channel notifications; closes when the session ends
    pub requests: mpsc::UnboundedReceiver<ControlEvent>,
    /// Channels opened by the server; closes when the session ends
    pub channels: mpsc::UnboundedReceiver<InboundChannel>,
}

impl SessionHandle {
    /// Disconnect the underlying SSH connection
    pub async fn close(&self) {
        close_connection(&self.connection).await;
    }
}

pub(crate) async fn close_connection(connection: &SecureConnection) {
    if connection.is_closed() {
        return;
    }
    if let Err(e) = connection
        .disconnect(russh::Disconnect::ByApplication, "", "English")
        .await
    {
        debug!("SSH disconnect failed: {}", e);
    }
}

/// SSH event handler: verifies the server key and relays server-initiated
/// traffic to the session processor. Dropped when the session ends, which
/// closes both relay streams.
pub struct ClientHandler {
    expected_fingerprint: String,
    requests: mpsc::UnboundedSender<ControlEvent>,
    channels: mpsc::UnboundedSender<InboundChannel>,
}

impl ClientHandler {
    fn new(
        expected_fingerprint: String,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ControlEvent>,
        mpsc::UnboundedReceiver<InboundChannel>,
    ) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (channels_tx, channels_rx) = mpsc::unbounded_channel();
        let handler = Self {
            expected_fingerprint,
            requests: requests_tx,
            channels: channels_tx,
        };
        (handler, requests_rx, channels_rx)
    }
}

/// Accept `got` when no fingerprint is expected or `got` starts with the
/// expected prefix
pub fn verify_fingerprint(expected: &str, got: &str) -> Result<()> {
    if !expected.is_empty() && !got.starts_with(expected) {
        return Err(ClientError::FingerprintMismatch(got.to_string()));
    }
    Ok(())
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = ClientError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let got = fingerprint(&server_public_key.public_key_bytes());
        verify_fingerprint(&self.expected_fingerprint, &got)?;
        info!("Fingerprint {}", got);
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = self.channels.send(InboundChannel::ForwardedTcpip {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        trace!("Channel {:?} EOF", channel);
        let _ = self.requests.send(ControlEvent::ChannelEof(channel));
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        trace!("Channel {:?} closed", channel);
        let _ = self.requests.send(ControlEvent::ChannelClosed(channel));
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> std::result::Result<(), Self::Error> {
        match reason {
            client::DisconnectReason::ReceivedDisconnect(info) => {
                debug!("Server disconnected: {:?}", info);
                Ok(())
            }
            client::DisconnectReason::Error(e) => {
                if let ClientError::Ssh(ssh) = &e {
                    let _ = self.requests.send(failure_event(ssh));
                }
                // Returned so a failing handshake still reports its cause
                Err(e)
            }
        }
    }
}

/// SSH client configuration for every attempt
pub fn ssh_config(keep_alive: Duration) -> client::Config {
    client::Config {
        client_id: russh::SshId::Standard(client_banner()),
        keepalive_interval: (!keep_alive.is_zero()).then_some(keep_alive),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    }
}

/// Dial the server and run the SSH handshake over the websocket.
///
/// Errors are classified where they occur: dial failures are
/// [`ClientError::Transport`], a password rejection is
/// [`ClientError::AuthFailed`] and a host key that does not match the
/// expected fingerprint is [`ClientError::FingerprintMismatch`].
pub async fn handshake(
    settings: &Settings,
    connector: &WebSocketConnector,
    ssh_config: Arc<client::Config>,
) -> Result<SessionHandle> {
    let conn = connector.connect(&settings.endpoint).await?;

    debug!("Handshaking...");
    let (handler, requests, channels) = ClientHandler::new(settings.fingerprint.clone());

    let connection = tokio::time::timeout(SSH_HANDSHAKE_TIMEOUT, async {
        let mut handle = client::connect_stream(ssh_config, conn, handler).await?;
        let authenticated = handle
            .authenticate_password(settings.user.clone(), settings.password.clone())
            .await?;
        if !authenticated {
            info!("Authentication failed");
            close_connection(&handle).await;
            return Err(ClientError::AuthFailed);
        }
        Ok::<_, ClientError>(handle)
    })
    .await
    .map_err(|_| ClientError::HandshakeTimeout(SSH_HANDSHAKE_TIMEOUT))??;

    Ok(SessionHandle {
        connection: Arc::new(connection),
        requests,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_prefix_match() {
        assert!(verify_fingerprint("ab:cd", "ab:cd:ef:00").is_ok());
        assert!(verify_fingerprint("ab:cd:ef:00", "ab:cd:ef:00").is_ok());
    }

    #[test]
    fn test_fingerprint_mismatch_names_presented_key() {
        let err = verify_fingerprint("ab:cd", "zz:zz").unwrap_err();
        assert!(matches!(err, ClientError::FingerprintMismatch(_)));
        assert!(err.to_string().contains("zz:zz"));
    }

    #[test]
    fn test_empty_fingerprint_accepts_any_key() {
        assert!(verify_fingerprint("", "anything").is_ok());
    }

    #[tokio::test]
    async fn test_session_failure_is_forwarded() {
        use client::Handler;

        let (mut handler, mut requests, mut channels) = ClientHandler::new(String::new());
        let cause = ClientError::Ssh(russh::Error::IO(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        )));

        let returned = handler
            .disconnected(client::DisconnectReason::Error(cause))
            .await;
        assert!(matches!(returned, Err(ClientError::Ssh(russh::Error::IO(_)))));

        match requests.try_recv() {
            Ok(ControlEvent::Failed(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected event {:?}", other),
        }

        drop(handler);
        assert!(requests.recv().await.is_none());
        assert!(channels.recv().await.is_none());
    }

    #[test]
    fn test_failure_event_kinds() {
        match failure_event(&russh::Error::KeepaliveTimeout) {
            ControlEvent::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected event {:?}", other),
        }
        match failure_event(&russh::Error::Disconnect) {
            ControlEvent::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_ssh_config_banner_and_keepalive() {
        let config = ssh_config(Duration::from_secs(25));
        match &config.client_id {
            russh::SshId::Standard(id) => assert_eq!(id, "SSH-2.0-burrow-v1-client"),
            _ => panic!("expected a standard SSH identification"),
        }
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(25)));

        let config = ssh_config(Duration::ZERO);
        assert!(config.keepalive_interval.is_none());
    }
}
