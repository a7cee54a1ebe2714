//! Client-side session supervision with fixed-delay reconnection.
//!
//! A [`ReconnectingClient`] owns at most one live [`Session`] at a time. When
//! that session closes, the supervisor task redials after `delay`, retrying
//! with the same delay until it succeeds, the attempt budget is spent, or the
//! client is closed.

use crate::error::SessionError;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reconnection policy
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Whether a closed session is redialed
    pub enabled: bool,
    /// Fixed delay before every redial
    pub delay: Duration,
    /// Attempts allowed per outage, 0 for unlimited
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(5),
            max_attempts: 0,
        }
    }
}

/// Connection phase of a reconnecting client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No session and no dial in flight
    Disconnected,
    /// Dial in flight
    Connecting,
    /// Session established
    Connected,
    /// Waiting out the retry delay
    Reconnecting,
}

/// Produces a fresh, not yet started session
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Establish a connection and wrap it in a session
    async fn dial(&self) -> Result<Session, SessionError>;
}

#[async_trait]
impl<F, Fut> Dialer for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Session, SessionError>> + Send + 'static,
{
    async fn dial(&self) -> Result<Session, SessionError> {
        (self)().await
    }
}

/// Connection lifecycle hooks
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// First successful connection
    async fn on_connect(&self, _client: &ReconnectingClient) {}

    /// The current session closed
    async fn on_disconnect(&self, _client: &ReconnectingClient) {}

    /// Connection re-established after `attempts` retries
    async fn on_reconnect(&self, _client: &ReconnectingClient, _attempts: u32) {}

    /// The attempt budget ran out; the client will not dial again
    async fn on_exhausted(&self, _client: &ReconnectingClient, _attempts: u32) {}
}

struct NoopClientHandler;

impl ClientHandler for NoopClientHandler {}

#[derive(Debug)]
struct ClientStatus {
    phase: ClientState,
    attempts: u32,
    ever_connected: bool,
    exhausted: bool,
    started: bool,
}

struct ClientInner {
    dialer: Arc<dyn Dialer>,
    handler: Arc<dyn ClientHandler>,
    config: ReconnectConfig,
    status: Mutex<ClientStatus>,
    session: Mutex<Option<Session>>,
    /// Fired by `close()`; independent of any session token
    stop: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Session wrapper that redials on disconnection
#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("ReconnectingClient")
            .field("phase", &status.phase)
            .field("attempts", &status.attempts)
            .field("exhausted", &status.exhausted)
            .field("config", &self.inner.config)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReconnectingClient {
    /// Create a client without lifecycle hooks
    pub fn new(dialer: impl Dialer, config: ReconnectConfig) -> Self {
        Self::with_handler(dialer, config, Arc::new(NoopClientHandler))
    }

    /// Create a client that reports lifecycle events to `handler`
    pub fn with_handler(
        dialer: impl Dialer,
        config: ReconnectConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dialer: Arc::new(dialer),
                handler,
                config,
                status: Mutex::new(ClientStatus {
                    phase: ClientState::Disconnected,
                    attempts: 0,
                    ever_connected: false,
                    exhausted: false,
                    started: false,
                }),
                session: Mutex::new(None),
                stop: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, ClientStatus> {
        lock(&self.inner.status)
    }

    fn set_phase(&self, phase: ClientState) {
        self.status().phase = phase;
    }

    /// Dial and start the first session, then supervise it.
    ///
    /// A failed initial dial is returned; with reconnection enabled the
    /// supervisor keeps retrying in the background regardless.
    pub async fn start(&self) -> Result<(), SessionError> {
        {
            let mut status = self.status();
            if self.inner.stop.is_cancelled() {
                return Err(SessionError::Closed);
            }
            if status.started {
                return Err(SessionError::AlreadyStarted);
            }
            status.started = true;
            status.phase = ClientState::Connecting;
        }

        let result = match self.inner.dialer.dial().await {
            Ok(session) => self.install(session).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => self.spawn_supervisor(),
            Err(e) => {
                warn!("Initial connection failed: {}", e);
                self.set_phase(ClientState::Disconnected);
                if self.inner.config.enabled {
                    self.spawn_supervisor();
                }
            }
        }
        result
    }

    /// Make `session` current and start it
    async fn install(&self, session: Session) -> Result<(), SessionError> {
        let (reconnected, attempts) = {
            let mut status = self.status();
            let previous = (status.ever_connected, status.attempts);
            status.phase = ClientState::Connected;
            status.attempts = 0;
            status.ever_connected = true;
            previous
        };
        *lock(&self.inner.session) = Some(session.clone());

        if reconnected {
            info!("Reconnected to {} after {} attempts", session.remote_addr(), attempts);
            self.inner.handler.on_reconnect(self, attempts).await;
        } else {
            info!("Connected to {}", session.remote_addr());
            self.inner.handler.on_connect(self).await;
        }

        if let Err(e) = session.start().await {
            error!("Failed to start session to {}: {}", session.remote_addr(), e);
            lock(&self.inner.session).take();
            {
                let mut status = self.status();
                status.phase = ClientState::Disconnected;
                status.attempts = attempts;
                status.ever_connected = reconnected;
            }
            if let Err(close_err) = session.close().await {
                warn!("Error closing unstarted session: {}", close_err);
            }
            return Err(e);
        }

        // close() may have raced with the dial
        if self.inner.stop.is_cancelled() {
            if let Err(e) = session.close().await {
                warn!("Error closing session after stop: {}", e);
            }
        }
        Ok(())
    }

    fn spawn_supervisor(&self) {
        let client = self.clone();
        let handle = tokio::spawn(async move { client.supervise().await });
        *lock(&self.inner.supervisor) = Some(handle);
    }

    async fn supervise(self) {
        loop {
            let current = lock(&self.inner.session).clone();
            if let Some(session) = current {
                session.closed().await;
                {
                    let mut slot = lock(&self.inner.session);
                    if slot.as_ref().is_some_and(|s| s.ptr_eq(&session)) {
                        slot.take();
                    }
                }
                self.set_phase(ClientState::Disconnected);
                info!("Disconnected from {}", session.remote_addr());
                self.inner.handler.on_disconnect(&self).await;
            }

            if !self.inner.config.enabled || self.inner.stop.is_cancelled() {
                self.set_phase(ClientState::Disconnected);
                return;
            }
            if !self.reconnect().await {
                return;
            }
        }
    }

    /// Retry until a session is installed; false once the client gives up
    async fn reconnect(&self) -> bool {
        let max = self.inner.config.max_attempts;
        let delay = self.inner.config.delay;

        loop {
            let attempt = {
                let mut status = self.status();
                if max > 0 && status.attempts >= max {
                    status.exhausted = true;
                    status.phase = ClientState::Disconnected;
                    None
                } else {
                    status.attempts += 1;
                    status.phase = ClientState::Reconnecting;
                    Some(status.attempts)
                }
            };
            let Some(attempt) = attempt else {
                error!("Giving up after {} reconnection attempts", max);
                self.inner.handler.on_exhausted(self, max).await;
                return false;
            };

            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => {
                    self.set_phase(ClientState::Disconnected);
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_phase(ClientState::Connecting);
            let dialed = tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => {
                    self.set_phase(ClientState::Disconnected);
                    return false;
                }
                dialed = self.inner.dialer.dial() => dialed,
            };

            match dialed {
                Ok(session) => match self.install(session).await {
                    Ok(()) => return true,
                    Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                },
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.set_phase(ClientState::Disconnected);
                }
            }
        }
    }

    /// Disable reconnection and close the current session
    pub async fn close(&self) -> Result<(), SessionError> {
        self.inner.stop.cancel();
        let session = lock(&self.inner.session).clone();
        match session {
            Some(session) => session.close().await,
            None => {
                self.set_phase(ClientState::Disconnected);
                Ok(())
            }
        }
    }

    /// Wait for the supervisor to exit after `close()` or exhaustion
    pub async fn join(&self) {
        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Reconnect supervisor failed: {}", e);
            }
        }
    }

    /// Queue a payload on the current session
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        let session = self.session().ok_or(SessionError::NotConnected)?;
        session.write(payload).await
    }

    /// Current session, if connected
    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session).clone()
    }

    /// Current connection phase
    pub fn state(&self) -> ClientState {
        self.status().phase
    }

    /// Whether a session is established
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Retries spent in the current outage; reset by every successful connect
    pub fn reconnect_attempt_count(&self) -> u32 {
        self.status().attempts
    }

    /// Whether the attempt budget ran out
    pub fn is_exhausted(&self) -> bool {
        self.status().exhausted
    }
}
