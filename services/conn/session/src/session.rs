//! Core session state machine.
//!
//! A [`Session`] owns one transport handle and drives it with three tasks: a
//! write-drain loop fed by a bounded outbound queue, a read loop dispatching
//! units to the [`SessionHandler`], and an optional idle checker. All three
//! observe a single cancellation token that fires exactly once, on close.
//!
//! ```text
//! Created --start()--> Running --close()/error/idle--> Closed
//!    \______________________close()_______________________/
//! ```

use crate::error::SessionError;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for a session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How long `write` may wait for queue space before dropping the payload
    pub write_timeout: Duration,
    /// Per-read deadline; zero disables it
    pub read_timeout: Duration,
    /// Close after this long without successful I/O; zero disables it
    pub idle_timeout: Duration,
    /// How often the idle checker looks at the last-active timestamp
    pub idle_check_interval: Duration,
    /// Capacity of the outbound queue
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(5 * 60),
            idle_timeout: Duration::ZERO,
            idle_check_interval: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, loops not running yet
    Created,
    /// Read/write loops are running
    Running,
    /// Terminal
    Closed,
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total payload bytes received
    pub bytes_in: u64,
    /// Total payload bytes sent
    pub bytes_out: u64,
    /// Number of units received
    pub units_in: u64,
    /// Number of units sent
    pub units_out: u64,
    /// Payloads dropped by backpressure or cancellation
    pub dropped_writes: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    units_in: AtomicU64,
    units_out: AtomicU64,
    dropped_writes: AtomicU64,
}

/// Callbacks a consumer attaches to a session
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Called once when the session starts, before any unit is read
    async fn on_connect(&self, _session: &Session) {}

    /// Called for every unit read from the transport, in arrival order
    async fn on_data(&self, session: &Session, data: Bytes) -> anyhow::Result<()>;

    /// Called once after the transport has been closed
    async fn on_close(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// Error sink for conditions that do not propagate to a caller: dropped
    /// writes, handler failures and transport errors seen by the loops
    fn on_error(&self, _session: &Session, _error: &SessionError) {}
}

/// Mutable session fields, all guarded by one lock
struct Shared {
    id: u64,
    state: SessionState,
    last_active: Instant,
    outbound_tx: Option<mpsc::Sender<Bytes>>,
}

struct Inner {
    name: String,
    remote_addr: String,
    created_at: Instant,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    handler: Option<Arc<dyn SessionHandler>>,
    shared: RwLock<Shared>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
    stats: StatCounters,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    id: u64,
    name: Option<String>,
    config: SessionConfig,
    handler: Option<Arc<dyn SessionHandler>>,
}

impl SessionBuilder {
    /// Set the initial session id
    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Set a human-readable name (defaults to the remote address)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the session configuration
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the data handler
    pub fn handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the session in the `Created` state.
    ///
    /// A zero idle check interval falls back to the default one.
    pub fn build(mut self) -> Session {
        if self.config.idle_check_interval.is_zero() {
            let fallback = SessionConfig::default().idle_check_interval;
            warn!("Idle check interval must be non-zero, using {:?}", fallback);
            self.config.idle_check_interval = fallback;
        }
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let remote_addr = self.transport.remote_addr();
        let now = Instant::now();

        Session {
            inner: Arc::new(Inner {
                name: self.name.unwrap_or_else(|| remote_addr.clone()),
                remote_addr,
                created_at: now,
                config: self.config,
                transport: self.transport,
                handler: self.handler,
                shared: RwLock::new(Shared {
                    id: self.id,
                    state: SessionState::Created,
                    last_active: now,
                    outbound_tx: Some(outbound_tx),
                }),
                outbound_rx: Mutex::new(Some(outbound_rx)),
                cancel: CancellationToken::new(),
                stats: StatCounters::default(),
            }),
        }
    }
}

/// One live logical connection.
///
/// Cloning is cheap; all clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.read_shared();
        f.debug_struct("Session")
            .field("id", &shared.id)
            .field("name", &self.inner.name)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &shared.state)
            .finish()
    }
}

impl Session {
    /// Start building a session around a transport
    pub fn builder(transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            transport,
            id: 0,
            name: None,
            config: SessionConfig::default(),
            handler: None,
        }
    }

    fn read_shared(&self) -> RwLockReadGuard<'_, Shared> {
        self.inner.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shared(&self) -> RwLockWriteGuard<'_, Shared> {
        self.inner.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition `Created → Running` and spawn the session loops.
    ///
    /// A no-op on a closed session; an error on a running one or when no
    /// data handler was attached.
    pub async fn start(&self) -> Result<(), SessionError> {
        let handler = {
            let mut shared = self.write_shared();
            match shared.state {
                SessionState::Closed => return Ok(()),
                SessionState::Running => return Err(SessionError::AlreadyStarted),
                SessionState::Created => {}
            }
            let handler = self
                .inner
                .handler
                .clone()
                .ok_or(SessionError::MissingHandler)?;
            shared.state = SessionState::Running;
            shared.last_active = Instant::now();
            handler
        };

        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!(
            "Starting session {} ({}) with {}",
            self.id(),
            self.inner.name,
            self.inner.remote_addr
        );

        handler.on_connect(self).await;

        if let Some(rx) = outbound_rx {
            tokio::spawn(self.clone().write_loop(rx));
        }
        tokio::spawn(self.clone().read_loop(handler));
        if !self.inner.config.idle_timeout.is_zero() {
            tokio::spawn(self.clone().idle_loop());
        }

        Ok(())
    }

    /// Queue a payload for transmission.
    ///
    /// When the queue is full this waits up to the write timeout; on timeout
    /// or cancellation the payload is dropped and the condition is returned
    /// and reported to the handler's error sink.
    ///
    /// `Ok` means the payload was queued, not that it reached the peer. A
    /// write racing with `close` may be accepted and then discarded when the
    /// write loop exits.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(SessionError::EmptyPayload);
        }

        let tx = {
            let shared = self.read_shared();
            if shared.state == SessionState::Closed {
                return Err(SessionError::Closed);
            }
            match &shared.outbound_tx {
                Some(tx) => tx.clone(),
                None => return Err(SessionError::Closed),
            }
        };

        let payload = match tx.try_send(payload) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(SessionError::Closed),
            Err(TrySendError::Full(payload)) => payload,
        };

        debug!("Outbound queue full for session {}, waiting", self.id());
        let write_timeout = self.inner.config.write_timeout;

        let err = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => SessionError::Cancelled,
            sent = tokio::time::timeout(write_timeout, tx.send(payload)) => match sent {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => return Err(SessionError::Closed),
                Err(_) => SessionError::WriteTimeout(write_timeout),
            },
        };

        self.inner.stats.dropped_writes.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping payload for session {}: {}", self.id(), err);
        self.report(&err);
        Err(err)
    }

    /// Close the session.
    ///
    /// The first call fires the cancellation token, closes the outbound queue
    /// and closes the transport, returning the transport's result. Every later
    /// or concurrent call returns `Ok(())` without side effects.
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let mut shared = self.write_shared();
            if shared.state == SessionState::Closed {
                return Ok(());
            }
            shared.state = SessionState::Closed;
            self.inner.cancel.cancel();
            shared.outbound_tx = None;
        }
        // Release anything still queued on a session that never started
        self.inner
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!(
            "Closing session {} ({}). Stats: {:?}",
            self.id(),
            self.inner.name,
            self.stats()
        );

        let result = self.inner.transport.close().await;
        if let Err(e) = &result {
            warn!("Transport close failed for session {}: {}", self.id(), e);
        }

        if let Some(handler) = &self.inner.handler {
            if let Err(e) = handler.on_close(self).await {
                warn!("on_close handler failed for session {}: {:#}", self.id(), e);
            }
        }

        result
    }

    /// Close from inside a loop; the outcome is already logged by `close`
    async fn close_quietly(&self) {
        let _ = self.close().await;
    }

    fn report(&self, error: &SessionError) {
        if let Some(handler) = &self.inner.handler {
            handler.on_error(self, error);
        }
    }

    /// Bump last-active, never moving it backwards
    fn touch(&self) {
        let mut shared = self.write_shared();
        let now = Instant::now();
        if shared.state == SessionState::Running && now > shared.last_active {
            shared.last_active = now;
        }
    }

    async fn write_loop(self, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(payload) => payload,
                    None => {
                        debug!("Outbound queue drained for session {}", self.id());
                        break;
                    }
                },
            };

            let len = payload.len() as u64;
            let result = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                result = self.inner.transport.write_unit(payload) => result,
            };

            match result {
                Ok(()) => {
                    self.touch();
                    self.inner.stats.units_out.fetch_add(1, Ordering::Relaxed);
                    self.inner.stats.bytes_out.fetch_add(len, Ordering::Relaxed);
                    debug!("Sent {} bytes on session {}", len, self.id());
                }
                Err(e) => {
                    error!("Write failed on session {}: {}", self.id(), e);
                    self.report(&e);
                    self.close_quietly().await;
                    break;
                }
            }
        }
        debug!("Write loop for session {} exited", self.id());
    }

    async fn read_unit(&self) -> Result<Bytes, SessionError> {
        let read_timeout = self.inner.config.read_timeout;
        if read_timeout.is_zero() {
            return self.inner.transport.read_unit().await;
        }
        tokio::time::timeout(read_timeout, self.inner.transport.read_unit())
            .await
            .map_err(|_| SessionError::ReadTimeout(read_timeout))?
    }

    async fn read_loop(self, handler: Arc<dyn SessionHandler>) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                result = self.read_unit() => result,
            };

            match result {
                Ok(data) => {
                    self.touch();
                    self.inner.stats.units_in.fetch_add(1, Ordering::Relaxed);
                    self.inner
                        .stats
                        .bytes_in
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    debug!("Received {} bytes on session {}", data.len(), self.id());

                    if let Err(e) = handler.on_data(&self, data).await {
                        warn!("Data handler failed on session {}: {:#}", self.id(), e);
                        handler.on_error(&self, &SessionError::Handler(e));
                    }
                }
                Err(e) => {
                    if !self.is_closed() {
                        warn!("Read failed on session {}: {}", self.id(), e);
                        handler.on_error(&self, &e);
                    }
                    self.close_quietly().await;
                    break;
                }
            }
        }
        debug!("Read loop for session {} exited", self.id());
    }

    async fn idle_loop(self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut ticker = tokio::time::interval(self.inner.config.idle_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let idle_for = self.last_active_at().elapsed();
            if idle_for > idle_timeout {
                warn!(
                    "Idle timeout reached for session {} ({:?} without I/O); closing",
                    self.id(),
                    idle_for
                );
                self.close_quietly().await;
                break;
            }
        }
    }

    /// Assign the session id; rejected once the session is closed
    pub fn set_id(&self, id: u64) -> Result<(), SessionError> {
        let mut shared = self.write_shared();
        if shared.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        shared.id = id;
        Ok(())
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.read_shared().id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Remote address as reported by the transport
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.read_shared().state
    }

    /// Whether the session reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.read_shared().state == SessionState::Closed
    }

    /// Creation timestamp
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Time of the last successful read or write
    pub fn last_active_at(&self) -> Instant {
        self.read_shared().last_active
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> SessionStats {
        let stats = &self.inner.stats;
        SessionStats {
            bytes_in: stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: stats.bytes_out.load(Ordering::Relaxed),
            units_in: stats.units_in.load(Ordering::Relaxed),
            units_out: stats.units_out.load(Ordering::Relaxed),
            dropped_writes: stats.dropped_writes.load(Ordering::Relaxed),
        }
    }

    /// Resolves once the session has been closed
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Whether two handles refer to the same session
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
