/// Session tests against an in-process SSH server reached through a
/// websocket upgrade, the way a burrow server is reached.
use async_trait::async_trait;
use burrow_client::{
    CancellationToken, Client, ClientConfig, ListenerBinder, Remote, RemoteSet, SessionHandle,
    SessionProcessor, Tunnel, TunnelError,
};
use burrow_proto::SessionConfig;
use burrow_transport_websocket::WebSocketConn;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// What the server saw across all connections
#[derive(Default)]
struct ServerLog {
    connections: AtomicUsize,
    accepted_at: Mutex<Vec<Instant>>,
    configs: Mutex<Vec<Vec<u8>>>,
}

impl ServerLog {
    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

struct TestServer {
    port: u16,
    fingerprint: String,
    log: Arc<ServerLog>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// SSH server behind a websocket upgrade. Accepts user `burrow` with
/// `password` and answers every `config` request with `reply`.
async fn spawn_server(password: &'static str, reply: &'static str) -> TestServer {
    let key = KeyPair::generate_ed25519().unwrap();
    let fingerprint = burrow_proto::fingerprint(&key.clone_public_key().unwrap().public_key_bytes());
    let config = Arc::new(server::Config {
        keys: vec![key],
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: None,
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(ServerLog::default());

    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_log.connections.fetch_add(1, Ordering::SeqCst);
            server_log.accepted_at.lock().unwrap().push(Instant::now());

            let config = config.clone();
            let log = server_log.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol).await else {
                    return;
                };
                let handler = SshServer {
                    password,
                    reply,
                    log,
                    payload: Vec::new(),
                    channels: Vec::new(),
                };
                if let Ok(session) = server::run_stream(config, WebSocketConn::new(ws), handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    TestServer {
        port,
        fingerprint,
        log,
    }
}

/// tungstenite clients reject upgrades that drop the requested subprotocol
fn echo_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    if let Some(protocol) = req.headers().get("sec-websocket-protocol") {
        resp.headers_mut()
            .insert("sec-websocket-protocol", protocol.clone());
    }
    Ok(resp)
}

struct SshServer {
    password: &'static str,
    reply: &'static str,
    log: Arc<ServerLog>,
    payload: Vec<u8>,
    channels: Vec<Channel<Msg>>,
}

#[async_trait]
impl server::Handler for SshServer {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == "burrow" && password == self.password {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.push(channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name == "config" {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.payload.extend_from_slice(data);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.log
            .configs
            .lock()
            .unwrap()
            .push(std::mem::take(&mut self.payload));
        if !self.reply.is_empty() {
            session.data(channel, CryptoVec::from_slice(self.reply.as_bytes()));
        }
        session.eof(channel);
        session.close(channel);
        Ok(())
    }
}

/// Counts sessions and ends each one right away, optionally with an error
#[derive(Default)]
struct CountingProcessor {
    sessions: AtomicUsize,
    fail_with: Option<io::ErrorKind>,
}

impl CountingProcessor {
    fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProcessor for CountingProcessor {
    async fn process(
        &self,
        _token: CancellationToken,
        _session: SessionHandle,
    ) -> Result<(), TunnelError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(kind) => Err(TunnelError::Io(io::Error::new(kind, "session failed"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ListenerBinder for CountingProcessor {
    async fn bind(&self, token: CancellationToken, _remotes: Vec<Remote>) -> Result<(), TunnelError> {
        token.cancelled().await;
        Ok(())
    }
}

fn client_for(config: &ClientConfig, processor: &Arc<CountingProcessor>) -> Client {
    Client::with_collaborators(config, processor.clone(), processor.clone()).unwrap()
}

async fn run_to_end(client: &Client) {
    let result = tokio::time::timeout(Duration::from_secs(10), client.run(&CancellationToken::new()))
        .await
        .expect("client should give up on its own");
    assert!(result.is_ok(), "giving up is not an error: {:?}", result);
}

#[tokio::test]
async fn test_rejected_password_is_not_retried() {
    init_tracing();
    let server = spawn_server("secret", "").await;
    let config = ClientConfig::builder()
        .server(server.url())
        .auth("burrow:wrong")
        .remote("R:2222:localhost:22")
        .build()
        .unwrap();
    let processor = Arc::new(CountingProcessor::default());

    run_to_end(&client_for(&config, &processor)).await;

    assert_eq!(server.log.connections(), 1);
    assert_eq!(processor.sessions(), 0);
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_not_retried() {
    init_tracing();
    let server = spawn_server("secret", "").await;
    let config = ClientConfig::builder()
        .server(server.url())
        .fingerprint("not-a-key")
        .auth("burrow:secret")
        .remote("R:2222:localhost:22")
        .build()
        .unwrap();
    let processor = Arc::new(CountingProcessor::default());

    run_to_end(&client_for(&config, &processor)).await;

    assert_eq!(server.log.connections(), 1);
    assert_eq!(processor.sessions(), 0);
    assert!(server.log.configs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_config_stops_before_processing() {
    init_tracing();
    let server = spawn_server("secret", "remote not allowed").await;
    let config = ClientConfig::builder()
        .server(server.url())
        .auth("burrow:secret")
        .remote("R:2222:localhost:22")
        .build()
        .unwrap();
    let processor = Arc::new(CountingProcessor::default());

    run_to_end(&client_for(&config, &processor)).await;

    assert_eq!(server.log.connections(), 1);
    assert_eq!(server.log.configs.lock().unwrap().len(), 1);
    assert_eq!(processor.sessions(), 0);
}

#[tokio::test]
async fn test_config_payload_reaches_server() {
    init_tracing();
    let server = spawn_server("secret", "").await;
    let config = ClientConfig::builder()
        .server(server.url())
        .fingerprint(&server.fingerprint[..8])
        .auth("burrow:secret")
        .remote("R:2222:localhost:22")
        .remote("3000")
        .max_retry_count(Some(0))
        .build()
        .unwrap();
    let processor = Arc::new(CountingProcessor::default());

    run_to_end(&client_for(&config, &processor)).await;

    assert_eq!(processor.sessions(), 1);
    let configs = server.log.configs.lock().unwrap();
    assert_eq!(configs.len(), 1);
    let received = SessionConfig::decode(&configs[0]).unwrap();
    let expected = RemoteSet::decode(["R:2222:localhost:22", "3000"]).unwrap();
    assert_eq!(received, SessionConfig::new(&expected));
    assert_eq!(received.version, "burrow-v1");
}

#[tokio::test]
async fn test_permanent_session_failure_stops() {
    init_tracing();
    let server = spawn_server("secret", "").await;
    let config = ClientConfig::builder()
        .server(server.url())
        .auth("burrow:secret")
        .remote("R:2222:localhost:22")
        .build()
        .unwrap();
    let processor = Arc::new(CountingProcessor {
        fail_with: Some(io::ErrorKind::PermissionDenied),
        ..Default::default()
    });

    run_to_end(&client_for(&config, &processor)).await;

    assert_eq!(server.log.connections(), 1);
    assert_eq!(processor.sessions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connected_sessions_reset_backoff() {
    init_tracing();
    let server = spawn_server("secret", "").await;
    // Without a reset this budget allows three connections at most
    let config = ClientConfig::builder()
        .server(server.url())
        .auth("burrow:secret")
        .remote("R:2222:localhost:22")
        .max_retry_count(Some(2))
        .build()
        .unwrap();
    let processor = Arc::new(CountingProcessor::default());
    let client = client_for(&config, &processor);

    let parent = CancellationToken::new();
    let stopper = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        stopper.cancel();
    });
    let result = tokio::time::timeout(Duration::from_secs(10), client.run(&parent))
        .await
        .expect("cancel should stop the client");
    assert!(result.is_ok());

    let connections = server.log.connections();
    assert!(connections > 3, "only {} connections", connections);
    assert!(processor.sessions() > 3);

    // Every retry waits the initial delay, never a doubled one
    let accepted = server.log.accepted_at.lock().unwrap();
    let longest = accepted
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .max()
        .unwrap();
    assert!(longest < Duration::from_millis(800), "gap of {:?}", longest);
}

#[tokio::test]
async fn test_cancelled_session_is_unpublished() {
    init_tracing();
    let server = spawn_server("secret", "").await;
    let config = ClientConfig::builder()
        .server(server.url())
        .fingerprint(server.fingerprint.clone())
        .auth("burrow:secret")
        .remote("R:2222:localhost:22")
        .build()
        .unwrap();
    let remotes = RemoteSet::decode(["R:2222:localhost:22"]).unwrap();
    let tunnel = Arc::new(Tunnel::new(remotes.capabilities()));
    let client = Client::with_collaborators(&config, tunnel.clone(), tunnel.clone()).unwrap();

    client.start(&CancellationToken::new()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !tunnel.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should be published");

    client.close().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), client.wait())
        .await
        .expect("close should stop the client");
    assert!(result.is_ok(), "{:?}", result);
    assert!(!tunnel.is_connected());
    assert_eq!(server.log.connections(), 1);
}
