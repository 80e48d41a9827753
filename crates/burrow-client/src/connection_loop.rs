//! Reconnection loop
//!
//! One attempt at a time: dial, handshake, negotiate, then hand the session
//! to the processor and block until it ends. Failed attempts are classified
//! by [`Disposition`]; retriable ones sleep for the backoff delay before the
//! next attempt. Reaching the connected state resets the backoff.

use burrow_proto::SessionConfig;
use burrow_transport_websocket::{WebSocketConfig, WebSocketConnector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Settings;
use crate::error::{ClientError, Disposition, Result};
use crate::handshake::{self, close_connection};
use crate::negotiate::negotiate;
use crate::tunnel::SessionProcessor;

/// What the loop does after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Retry(Duration),
    Stop,
}

/// Decide between sleeping and stopping. `backoff` must already be reset if
/// the attempt connected.
pub(crate) fn next_step(backoff: &mut Backoff, retry: bool, max_retry_count: Option<u32>) -> Step {
    let attempt = backoff.attempt();
    if !retry || max_retry_count.is_some_and(|max| attempt >= max) {
        return Step::Stop;
    }
    Step::Retry(backoff.duration())
}

/// Outcome of a single attempt
struct Attempt {
    connected: bool,
    result: Result<()>,
}

impl Attempt {
    fn failed(err: ClientError) -> Self {
        Self {
            connected: false,
            result: Err(err),
        }
    }
}

pub(crate) struct ConnectionLoop {
    settings: Arc<Settings>,
    connector: WebSocketConnector,
    ssh_config: Arc<russh::client::Config>,
    processor: Arc<dyn SessionProcessor>,
}

impl ConnectionLoop {
    pub(crate) fn new(settings: Arc<Settings>, processor: Arc<dyn SessionProcessor>) -> Result<Self> {
        let ws_config = WebSocketConfig::client_default(burrow_proto::PROTOCOL_VERSION)
            .with_headers(settings.headers.clone())
            .with_insecure_skip_verify(settings.tls_skip_verify);
        let connector = WebSocketConnector::new(Arc::new(ws_config), settings.strategy.clone())?;
        let ssh_config = Arc::new(handshake::ssh_config(settings.keep_alive));

        Ok(Self {
            settings,
            connector,
            ssh_config,
            processor,
        })
    }

    /// Run until the retry budget is spent, a fatal error occurs or `scope`
    /// is cancelled. Always cancels `scope` on the way out so sibling tasks
    /// stop too. Giving up is not an error for the caller.
    pub(crate) async fn run(&self, scope: CancellationToken) -> Result<()> {
        let _stop = scope.clone().drop_guard();
        let mut backoff = Backoff::new(self.settings.max_retry_interval);
        let max = self.settings.max_retry_count;

        loop {
            let attempt = self.connect_once(&scope).await;
            if attempt.connected {
                backoff.reset();
            }

            let n = backoff.attempt();
            let retry = match &attempt.result {
                Ok(()) => true,
                Err(e) => {
                    let mut msg = format!("Connection error: {}", e);
                    if n > 0 {
                        match max {
                            Some(max) if max > 0 => msg.push_str(&format!(" (Attempt: {}/{})", n, max)),
                            _ => msg.push_str(&format!(" (Attempt: {})", n)),
                        }
                    }
                    let disposition = e.disposition();
                    match disposition {
                        Disposition::Retriable => info!("{}", msg),
                        Disposition::Cancelled => debug!("{}", msg),
                        _ => warn!("{} ({:?})", msg, disposition),
                    }
                    disposition.is_retriable()
                }
            };

            match next_step(&mut backoff, retry, max) {
                Step::Stop => break,
                Step::Retry(delay) => {
                    info!("Retrying in {:?}...", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = scope.cancelled() => {
                            info!("Cancelled");
                            return Ok(());
                        }
                    }
                }
            }
        }

        debug!("Connection loop stopped");
        Ok(())
    }

    async fn connect_once(&self, scope: &CancellationToken) -> Attempt {
        if scope.is_cancelled() {
            return Attempt::failed(ClientError::Cancelled);
        }
        let token = scope.child_token();
        let _guard = token.clone().drop_guard();
        let started = Instant::now();

        let session = tokio::select! {
            biased;
            _ = token.cancelled() => return Attempt::failed(ClientError::Cancelled),
            outcome = handshake::handshake(&self.settings, &self.connector, self.ssh_config.clone()) => {
                match outcome {
                    Ok(session) => session,
                    Err(e) => return Attempt::failed(e),
                }
            }
        };
        let connection = session.connection.clone();

        let config = SessionConfig::new(&self.settings.remotes);
        let negotiated = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClientError::Cancelled),
            negotiated = negotiate(&connection, &config) => negotiated,
        };
        if let Err(e) = negotiated {
            close_connection(&connection).await;
            return Attempt::failed(e);
        }
        info!("Connected (Latency {:?})", started.elapsed());

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClientError::Cancelled),
            processed = self.processor.process(token.clone(), session) => processed.map_err(ClientError::from),
        };
        close_connection(&connection).await;
        info!("Disconnected");

        Attempt {
            connected: true,
            result,
        }
    }
}
