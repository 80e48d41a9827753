//! Client lifecycle: start, wait, close

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ClientConfig, Settings};
use crate::connection_loop::ConnectionLoop;
use crate::error::{ClientError, Disposition, Result};
use crate::tunnel::{ListenerBinder, SessionProcessor, Tunnel};

/// Cancellation scope plus the supervised tasks of one run
struct LifecycleState {
    scope: CancellationToken,
    group: Arc<tokio::sync::Mutex<TaskGroup>>,
}

/// Supervised tasks and the first failure among them. Waiters take turns on
/// the lock, so every `wait` blocks until the tasks are done.
struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    failure: Option<(String, Disposition)>,
}

/// A burrow client.
///
/// `start` launches the reconnection loop and the local listener binder as two
/// tasks sharing one cancellation scope. The first task to fail cancels the
/// scope, and `wait` reports that failure.
pub struct Client {
    settings: Arc<Settings>,
    connection_loop: Arc<ConnectionLoop>,
    binder: Arc<dyn ListenerBinder>,
    state: Mutex<Option<LifecycleState>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.settings.endpoint.url())
            .field("remotes", &self.settings.remotes.len())
            .finish()
    }
}

impl Client {
    /// Build a client that uses the built-in [`Tunnel`] engine
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let settings = config.resolve()?;
        let tunnel = Arc::new(Tunnel::new(settings.remotes.capabilities()));
        Self::from_settings(settings, tunnel.clone(), tunnel)
    }

    /// Build a client with custom session processing and listener binding
    pub fn with_collaborators(
        config: &ClientConfig,
        processor: Arc<dyn SessionProcessor>,
        binder: Arc<dyn ListenerBinder>,
    ) -> Result<Self> {
        Self::from_settings(config.resolve()?, processor, binder)
    }

    fn from_settings(
        settings: Settings,
        processor: Arc<dyn SessionProcessor>,
        binder: Arc<dyn ListenerBinder>,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let connection_loop = Arc::new(ConnectionLoop::new(settings.clone(), processor)?);
        Ok(Self {
            settings,
            connection_loop,
            binder,
            state: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, Option<LifecycleState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the supervised tasks and return immediately. The scope is a
    /// child of `parent`, so cancelling `parent` stops the client too.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut state = self.state();
        if state.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let scope = parent.child_token();
        let via = match &self.settings.proxy {
            Some(proxy) => format!(" via {}", proxy),
            None => String::new(),
        };
        info!("Connecting to {}{}", self.settings.endpoint, via);

        let mut tasks = JoinSet::new();
        {
            let connection_loop = self.connection_loop.clone();
            let scope = scope.clone();
            tasks.spawn(async move { connection_loop.run(scope).await });
        }
        {
            let binder = self.binder.clone();
            let scope = scope.clone();
            let inbound = self.settings.remotes.reversed(false);
            tasks.spawn(async move { binder.bind(scope, inbound).await.map_err(ClientError::from) });
        }

        *state = Some(LifecycleState {
            scope,
            group: Arc::new(tokio::sync::Mutex::new(TaskGroup {
                tasks,
                failure: None,
            })),
        });
        Ok(())
    }

    /// Block until both tasks finish. Returns the first error; that error
    /// has already cancelled the other task.
    ///
    /// Any number of callers may wait. The caller that observed the failure
    /// gets the original error, the others get [`ClientError::Stopped`] with
    /// the same message and disposition.
    pub async fn wait(&self) -> Result<()> {
        let (scope, group) = {
            let state = self.state();
            let state = state.as_ref().ok_or(ClientError::NotStarted)?;
            (state.scope.clone(), state.group.clone())
        };

        let mut group = group.lock().await;
        let mut observed = None;
        while let Some(joined) = group.tasks.join_next().await {
            let outcome = joined
                .map_err(|e| ClientError::TaskFailed(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = outcome {
                if group.failure.is_none() {
                    debug!("Supervised task failed, stopping client: {}", e);
                    scope.cancel();
                    group.failure = Some((e.to_string(), e.disposition()));
                    observed = Some(e);
                }
            }
        }

        if let Some(e) = observed {
            return Err(e);
        }
        match &group.failure {
            Some((message, disposition)) => Err(ClientError::Stopped {
                message: message.clone(),
                disposition: *disposition,
            }),
            None => Ok(()),
        }
    }

    /// Cancel the client. Safe before `start` and safe to repeat.
    pub fn close(&self) -> Result<()> {
        if let Some(state) = self.state().as_ref() {
            state.scope.cancel();
        }
        Ok(())
    }

    /// Start, then wait
    pub async fn run(&self, parent: &CancellationToken) -> Result<()> {
        self.start(parent)?;
        self.wait().await
    }
}
