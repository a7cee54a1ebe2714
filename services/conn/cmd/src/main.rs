//! Connection node binary.
//!
//! Runs either a relay server, which accepts framed TCP sessions, tracks their
//! heartbeats and rebroadcasts every message to the other sessions, or a
//! reconnecting client that sends a message on a fixed interval.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use conn_session::{
    listen_tcp, serve_tcp, ClientHandler, HeartbeatTracker, ReconnectingClient, Session,
    SessionError, SessionHandler, SessionRegistry, TcpDialer,
};
use conn_wire::MAX_PAYLOAD_SIZE;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ConnConfig;
use logging::RedbLogFormatter;

/// Connection node: relay server or reconnecting client
#[derive(Parser, Debug)]
#[command(name = "conn", version, about = "Framed TCP relay server and reconnecting client")]
struct Args {
    /// Listen address for relay mode, e.g. 0.0.0.0:9000
    #[arg(long, conflicts_with = "connect", required_unless_present = "connect")]
    listen: Option<SocketAddr>,

    /// Server address for client mode, e.g. 127.0.0.1:9000
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Message the client sends every interval
    #[arg(long, default_value = "ping")]
    message: String,

    /// Client send interval, e.g. 5s
    #[arg(long, default_value = "5s")]
    interval: humantime::Duration,

    /// Write timeout, e.g. 30s
    #[arg(long)]
    write_timeout: Option<humantime::Duration>,

    /// Idle timeout, e.g. 2m (0s disables)
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Heartbeat timeout, e.g. 30s
    #[arg(long)]
    heartbeat_timeout: Option<humantime::Duration>,

    /// Delay between reconnection attempts, e.g. 5s
    #[arg(long)]
    reconnect_delay: Option<humantime::Duration>,

    /// Maximum reconnection attempts (0 = unlimited)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Disable reconnection in client mode
    #[arg(long)]
    no_reconnect: bool,

    /// Maximum concurrent sessions in relay mode (0 = unlimited)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

impl Args {
    /// Explicit flags win over file and environment values
    fn apply_to(&self, config: &mut ConnConfig) -> anyhow::Result<()> {
        if self.connect.is_some() && self.interval.is_zero() {
            bail!("--interval must be greater than zero");
        }
        if let Some(timeout) = self.write_timeout {
            config.session.write_timeout = timeout.into();
        }
        if let Some(timeout) = self.idle_timeout {
            config.session.idle_timeout = timeout.into();
        }
        if let Some(timeout) = self.heartbeat_timeout {
            config.heartbeat_timeout = timeout.into();
        }
        if let Some(delay) = self.reconnect_delay {
            config.reconnect.delay = delay.into();
        }
        if let Some(max_attempts) = self.max_attempts {
            config.reconnect.max_attempts = max_attempts;
        }
        if self.no_reconnect {
            config.reconnect.enabled = false;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redb_conn={}", args.log_level).parse()?)
        .add_directive(format!("conn_session={}", args.log_level).parse()?)
        .add_directive(format!("conn_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(RedbLogFormatter::new("conn"))
        .init();

    info!("Starting reDB Conn Service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ConnConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config)?;

    match (args.listen, args.connect) {
        (Some(addr), _) => run_server(addr, config).await,
        (None, Some(addr)) => run_client(addr, &args, config).await,
        (None, None) => bail!("either --listen or --connect is required"),
    }
}

/// Relays every inbound message to all other sessions
struct RelayHandler {
    registry: Arc<SessionRegistry>,
    heartbeats: Arc<HeartbeatTracker>,
}

#[async_trait]
impl SessionHandler for RelayHandler {
    async fn on_connect(&self, session: &Session) {
        self.heartbeats.update_heartbeat(session.id()).await;
        component_info!(
            "relay",
            "Session {} connected from {}",
            session.id(),
            session.remote_addr()
        );
    }

    async fn on_data(&self, session: &Session, data: Bytes) -> anyhow::Result<()> {
        self.heartbeats.update_heartbeat(session.id()).await;
        let delivered = self.registry.broadcast_exclude(data, session.id()).await;
        component_debug!(
            "relay",
            "Relayed message from session {} to {} sessions",
            session.id(),
            delivered
        );
        Ok(())
    }

    async fn on_close(&self, session: &Session) -> anyhow::Result<()> {
        self.heartbeats.remove(session.id()).await;
        let stats = session.stats();
        component_info!(
            "relay",
            "Session {} closed (in: {} msgs/{} bytes, out: {} msgs/{} bytes, dropped: {})",
            session.id(),
            stats.units_in,
            stats.bytes_in,
            stats.units_out,
            stats.bytes_out,
            stats.dropped_writes
        );
        Ok(())
    }

    fn on_error(&self, session: &Session, error: &SessionError) {
        // A slow reader loses payloads but keeps its session
        if error.is_dropped_write() {
            component_debug!("relay", "Dropped payload for session {}: {}", session.id(), error);
        } else {
            component_warn!("relay", "Session {} error: {}", session.id(), error);
        }
    }
}

async fn run_server(addr: SocketAddr, config: ConnConfig) -> anyhow::Result<()> {
    let listener = listen_tcp(addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;
    info!("Relay listening on {}", listener.local_addr()?);

    let registry = Arc::new(SessionRegistry::with_max_sessions(config.max_sessions));

    // Evict sessions that stay silent for too many scans
    let evict_registry = Arc::downgrade(&registry);
    let max_misses = config.heartbeat_max_misses;
    let heartbeats = Arc::new(
        HeartbeatTracker::new(config.heartbeat_timeout).with_timeout_callback(move |id, misses| {
            if misses < max_misses {
                return;
            }
            let Some(registry) = evict_registry.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Some(session) = registry.get(id).await {
                    component_warn!(
                        "heartbeat",
                        "Evicting session {} after {} missed heartbeats",
                        id,
                        misses
                    );
                    if let Err(e) = session.close().await {
                        component_warn!("heartbeat", "Error closing session {}: {}", id, e);
                    }
                }
            });
        }),
    );
    let monitor = heartbeats.start_monitoring(config.heartbeat_interval);

    let handler = Arc::new(RelayHandler {
        registry: registry.clone(),
        heartbeats: heartbeats.clone(),
    });

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_tcp(
        listener,
        registry.clone(),
        config.session.clone(),
        handler,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received SIGINT signal, shutting down relay");

    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Relay accept loop ended with error: {}", e),
        Err(e) => warn!("Relay accept loop panicked: {}", e),
    }
    monitor.shutdown().await;

    let stats = registry.stats().await;
    info!(
        "Relay stopped: accepted={}, rejected={}, broadcasts={}, bytes={}",
        stats.total_accepted, stats.total_rejected, stats.total_messages, stats.total_bytes
    );
    Ok(())
}

/// Logs messages the server relays to this client
struct PrintHandler;

#[async_trait]
impl SessionHandler for PrintHandler {
    async fn on_data(&self, _session: &Session, data: Bytes) -> anyhow::Result<()> {
        component_info!("client", "Received: {}", String::from_utf8_lossy(&data));
        Ok(())
    }

    fn on_error(&self, session: &Session, error: &SessionError) {
        component_warn!("client", "Session {} error: {}", session.name(), error);
    }
}

/// Logs connection lifecycle events
struct LifecycleLogger;

#[async_trait]
impl ClientHandler for LifecycleLogger {
    async fn on_connect(&self, _client: &ReconnectingClient) {
        component_info!("client", "Connected");
    }

    async fn on_disconnect(&self, _client: &ReconnectingClient) {
        component_warn!("client", "Disconnected");
    }

    async fn on_reconnect(&self, _client: &ReconnectingClient, attempts: u32) {
        component_info!("client", "Reconnected after {} attempts", attempts);
    }

    async fn on_exhausted(&self, _client: &ReconnectingClient, attempts: u32) {
        component_warn!("client", "Giving up after {} attempts", attempts);
    }
}

async fn run_client(addr: SocketAddr, args: &Args, config: ConnConfig) -> anyhow::Result<()> {
    if args.message.is_empty() || args.message.len() > MAX_PAYLOAD_SIZE {
        bail!(
            "--message must be between 1 and {} bytes, got {}",
            MAX_PAYLOAD_SIZE,
            args.message.len()
        );
    }

    let dialer = TcpDialer::new(addr, config.session.clone(), Arc::new(PrintHandler));
    let client = ReconnectingClient::with_handler(
        dialer,
        config.reconnect.clone(),
        Arc::new(LifecycleLogger),
    );

    if let Err(e) = client.start().await {
        if !config.reconnect.enabled {
            return Err(e).with_context(|| format!("failed to connect to {}", addr));
        }
        warn!("Initial connection to {} failed, retrying in background: {}", addr, e);
    }

    let interval: Duration = args.interval.into();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let message = Bytes::from(args.message.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT signal, closing client");
                break;
            }
            _ = ticker.tick() => {
                if client.is_exhausted() {
                    warn!("Reconnection attempts exhausted, exiting");
                    break;
                }
                if !config.reconnect.enabled && !client.is_connected() {
                    warn!("Connection lost and reconnection is disabled, exiting");
                    break;
                }
                match client.write(message.clone()).await {
                    Ok(()) => component_debug!("client", "Sent {} bytes", message.len()),
                    Err(SessionError::NotConnected) => {
                        let state = client.state();
                        component_debug!("client", "Not connected ({:?}), skipping send", state)
                    }
                    Err(e) => component_warn!("client", "Send failed: {}", e),
                }
            }
        }
    }

    if let Err(e) = client.close().await {
        warn!("Error closing client: {}", e);
    }
    client.join().await;
    info!("Client stopped");
    Ok(())
}
