//! Session processing and local listeners
//!
//! The reconnection loop hands every negotiated session to a
//! [`SessionProcessor`] and the supervisor runs one [`ListenerBinder`] for the
//! client's lifetime. [`Tunnel`] implements both: while a session is active it
//! publishes the connection, and each local listener forwards accepted TCP
//! connections over `direct-tcpip` channels of whichever session is current.

use async_trait::async_trait;
use burrow_proto::{Capabilities, L4Proto, Remote};
use burrow_transport_websocket::is_permanent_io;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::handshake::{ControlEvent, InboundChannel, SecureConnection, SessionHandle};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Listener task failed: {0}")]
    Task(String),
}

impl TunnelError {
    /// Whether retrying the session cannot help
    pub fn is_permanent(&self) -> bool {
        match self {
            TunnelError::Io(e) => is_permanent_io(e),
            TunnelError::Ssh(russh::Error::IO(e)) => is_permanent_io(e),
            _ => false,
        }
    }
}

/// Consumes a negotiated session until it ends or `token` is cancelled
#[async_trait]
pub trait SessionProcessor: Send + Sync {
    async fn process(
        &self,
        token: CancellationToken,
        session: SessionHandle,
    ) -> Result<(), TunnelError>;
}

/// Binds local sockets for client-side remotes, once per client lifetime
#[async_trait]
pub trait ListenerBinder: Send + Sync {
    async fn bind(&self, token: CancellationToken, remotes: Vec<Remote>) -> Result<(), TunnelError>;
}

type ActiveConnection = Option<Arc<SecureConnection>>;

/// Built-in tunnel engine for forward TCP remotes
pub struct Tunnel {
    capabilities: Capabilities,
    active: watch::Sender<ActiveConnection>,
}

impl Tunnel {
    pub fn new(capabilities: Capabilities) -> Self {
        let (active, _) = watch::channel(None);
        debug!(
            "Tunnel created (inbound: {}, outbound: {}, socks: {})",
            capabilities.inbound(),
            capabilities.outbound(),
            capabilities.socks()
        );
        Self {
            capabilities,
            active,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether a session is currently published
    pub fn is_connected(&self) -> bool {
        self.active.borrow().is_some()
    }

    fn refuse(&self, inbound: InboundChannel) {
        warn!("Denied inbound {:?}: reverse forwarding is not supported", inbound);
        let InboundChannel::ForwardedTcpip { channel, .. } = inbound;
        tokio::spawn(async move {
            let _ = channel.close().await;
        });
    }
}

/// Forward remotes this engine can serve
fn is_local_forward(remote: &Remote) -> bool {
    !remote.reverse
        && !remote.socks
        && !remote.stdio
        && remote.local_proto == L4Proto::Tcp
        && remote.local_port.is_some()
        && remote.remote_port.is_some()
}

#[async_trait]
impl SessionProcessor for Tunnel {
    async fn process(
        &self,
        token: CancellationToken,
        session: SessionHandle,
    ) -> Result<(), TunnelError> {
        let SessionHandle {
            connection,
            mut requests,
            mut channels,
        } = session;

        let _published = Published::new(&self.active, connection);
        debug!("SSH session active");

        self.watch_session(&token, &mut requests, &mut channels)
            .await
    }
}

/// Keeps a session visible to the forwarders. Unpublishes on drop, including
/// when the processing future is cancelled.
struct Published<'a> {
    active: &'a watch::Sender<ActiveConnection>,
}

impl<'a> Published<'a> {
    fn new(active: &'a watch::Sender<ActiveConnection>, connection: Arc<SecureConnection>) -> Self {
        active.send_replace(Some(connection));
        Self { active }
    }
}

impl Drop for Published<'_> {
    fn drop(&mut self) {
        self.active.send_replace(None);
    }
}

impl Tunnel {
    /// Follow the session's side channels until it ends. A failure reported
    /// by the session becomes the result.
    async fn watch_session(
        &self,
        token: &CancellationToken,
        requests: &mut mpsc::UnboundedReceiver<ControlEvent>,
        channels: &mut mpsc::UnboundedReceiver<InboundChannel>,
    ) -> Result<(), TunnelError> {
        let mut failure = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                Some(event) = requests.recv() => match event {
                    ControlEvent::Failed(e) => failure = Some(e),
                    other => trace!("Session event {:?}", other),
                },
                inbound = channels.recv() => match inbound {
                    Some(inbound) => self.refuse(inbound),
                    None => break,
                },
            }
        }

        // Both streams close together; the failure may still be queued
        while let Ok(event) = requests.try_recv() {
            if let ControlEvent::Failed(e) = event {
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => {
                debug!("SSH session failed: {}", e);
                Err(TunnelError::Io(e))
            }
            None => {
                debug!("SSH session ended");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ListenerBinder for Tunnel {
    async fn bind(&self, token: CancellationToken, remotes: Vec<Remote>) -> Result<(), TunnelError> {
        let mut listeners = Vec::new();
        for remote in remotes {
            if !is_local_forward(&remote) {
                warn!("{}: not served by the built-in tunnel, skipping", remote);
                continue;
            }
            let listener = TcpListener::bind(remote.local()).await.map_err(|e| {
                error!("{}: failed to listen on {}: {}", remote, remote.local(), e);
                e
            })?;
            info!("{}: Listening", remote);
            listeners.push((remote, listener));
        }

        if listeners.is_empty() {
            debug!("No local listeners to bind");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for (remote, listener) in listeners {
            tasks.spawn(accept_loop(
                token.clone(),
                remote,
                listener,
                self.active.subscribe(),
            ));
        }
        debug!("Bound proxies");

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| TunnelError::Task(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = outcome {
                if result.is_ok() {
                    token.cancel();
                    result = Err(e);
                }
            }
        }
        debug!("Unbound proxies");
        result
    }
}

async fn accept_loop(
    token: CancellationToken,
    remote: Remote,
    listener: TcpListener,
    active: watch::Receiver<ActiveConnection>,
) -> Result<(), TunnelError> {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("{}: Closed", remote);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let _ = stream.set_nodelay(true);
                tokio::spawn(forward(
                    token.clone(),
                    remote.clone(),
                    stream,
                    peer,
                    active.clone(),
                ));
            }
        }
    }
}

/// Wait until a session is published; None when the tunnel is gone
async fn active_connection(
    active: &mut watch::Receiver<ActiveConnection>,
) -> Option<Arc<SecureConnection>> {
    active
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|conn| conn.clone())
}

async fn forward(
    token: CancellationToken,
    remote: Remote,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut active: watch::Receiver<ActiveConnection>,
) {
    let connection = tokio::select! {
        _ = token.cancelled() => return,
        conn = active_connection(&mut active) => match conn {
            Some(conn) => conn,
            None => return,
        },
    };

    let Some(port) = remote.remote_port else {
        return;
    };
    let channel = match connection
        .channel_open_direct_tcpip(
            remote.remote_host.clone(),
            u32::from(port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("{}: stream error: {}", remote, e);
            return;
        }
    };

    debug!("{}: open {}", remote, peer);
    let mut channel_stream = Box::pin(channel.into_stream());
    tokio::select! {
        _ = token.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream) => match copied {
            Ok((sent, received)) => debug!("{}: close {} (sent {}B received {}B)", remote, peer, sent, received),
            Err(e) => debug!("{}: close {}: {}", remote, peer, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::RemoteSet;
    use std::time::Duration;

    #[test]
    fn test_local_forward_filter() {
        let set = RemoteSet::decode(["3000", "R:2222:localhost:22", "socks", "53:1.1.1.1:53/udp"])
            .unwrap();
        let served: Vec<String> = set
            .iter()
            .filter(|r| is_local_forward(r))
            .map(|r| r.to_string())
            .collect();
        assert_eq!(served, vec!["3000=>3000".to_string()]);
    }

    #[test]
    fn test_permanent_tunnel_errors() {
        let err = TunnelError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(err.is_permanent());
        let err = TunnelError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!err.is_permanent());
        assert!(!TunnelError::Task("panicked".into()).is_permanent());
    }

    #[tokio::test]
    async fn test_session_failure_becomes_result() {
        let tunnel = Tunnel::new(Capabilities::default());
        let (requests_tx, mut requests) = mpsc::unbounded_channel();
        let (channels_tx, mut channels) = mpsc::unbounded_channel::<InboundChannel>();

        requests_tx
            .send(ControlEvent::Failed(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "denied",
            )))
            .unwrap();
        drop(requests_tx);
        drop(channels_tx);

        let err = tunnel
            .watch_session(&CancellationToken::new(), &mut requests, &mut channels)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(matches!(err, TunnelError::Io(ref e) if e.kind() == io::ErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn test_clean_session_end_is_ok() {
        let tunnel = Tunnel::new(Capabilities::default());
        let (requests_tx, mut requests) = mpsc::unbounded_channel::<ControlEvent>();
        let (channels_tx, mut channels) = mpsc::unbounded_channel::<InboundChannel>();

        // The handler went away without reporting a failure
        drop(requests_tx);
        drop(channels_tx);

        let result = tunnel
            .watch_session(&CancellationToken::new(), &mut requests, &mut channels)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_session_watch_returns() {
        let tunnel = Tunnel::new(Capabilities::default());
        let (_requests_tx, mut requests) = mpsc::unbounded_channel::<ControlEvent>();
        let (_channels_tx, mut channels) = mpsc::unbounded_channel::<InboundChannel>();
        let token = CancellationToken::new();
        token.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            tunnel.watch_session(&token, &mut requests, &mut channels),
        )
        .await
        .expect("cancelled watch should return");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_without_forwards_returns() {
        let tunnel = Tunnel::new(Capabilities::default());
        let remotes = RemoteSet::decode(["R:2222:localhost:22"]).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            tunnel.bind(CancellationToken::new(), remotes.reversed(false)),
        )
        .await
        .expect("bind should return immediately");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_listens_until_cancelled() {
        // Reserve a free port
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let tunnel = Arc::new(Tunnel::new(Capabilities::default()));
        let remotes = RemoteSet::decode([format!("127.0.0.1:{}:127.0.0.1:22", port)]).unwrap();
        let token = CancellationToken::new();

        let bind = {
            let tunnel = tunnel.clone();
            let token = token.clone();
            tokio::spawn(async move { tunnel.bind(token, remotes.reversed(false)).await })
        };

        // The listener accepts even without a live session
        let mut connected = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(connected, "listener never came up");
        assert!(!tunnel.is_connected());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), bind)
            .await
            .expect("bind should stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_fails_on_busy_port() {
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();

        let tunnel = Tunnel::new(Capabilities::default());
        let remotes = RemoteSet::decode([format!("127.0.0.1:{}:127.0.0.1:22", port)]).unwrap();
        let err = tunnel
            .bind(CancellationToken::new(), remotes.reversed(false))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Io(ref e) if e.kind() == io::ErrorKind::AddrInUse));
    }
}
