//! Transport abstraction and the framed TCP adapter.
//!
//! A transport supplies the four primitives a [`Session`] needs: it is opened
//! or accepted by the adapter, then read and written one unit at a time and
//! finally closed. Byte-stream transports get their unit boundaries from the
//! `conn-wire` length-prefixed codec.

use crate::error::SessionError;
use crate::reconnect::Dialer;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionConfig, SessionHandler};
use async_trait::async_trait;
use bytes::Bytes;
use conn_wire::{read_frame, write_frame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Primitives a concrete transport supplies to a session.
///
/// `read_unit` and `write_unit` are called from different tasks and may run
/// concurrently; each is only ever called by one task at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Read exactly one unit (one message) from the peer
    async fn read_unit(&self) -> Result<Bytes, SessionError>;

    /// Write exactly one unit to the peer
    async fn write_unit(&self, payload: Bytes) -> Result<(), SessionError>;

    /// Close the transport; must be idempotent
    async fn close(&self) -> Result<(), SessionError>;

    /// Printable remote address
    fn remote_addr(&self) -> String;
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Length-prefixed framing over a TCP stream
pub struct TcpTransport {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            peer_addr,
            closed: AtomicBool::new(false),
        })
    }

    /// Peer socket address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_unit(&self) -> Result<Bytes, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let mut reader = self.reader.lock().await;
        Ok(read_frame(&mut *reader).await?)
    }

    async fn write_unit(&self, payload: Bytes) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Shutting down TCP stream to {}", self.peer_addr);

        // Bytes left in the buffer by an interrupted write are discarded;
        // flushing them would block on a peer that stopped reading.
        let mut writer = self.writer.lock().await;
        match writer.get_mut().shutdown().await {
            Ok(()) => Ok(()),
            // Peer already went away
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remote_addr(&self) -> String {
        self.peer_addr.to_string()
    }
}

/// Dials a TCP peer and wraps the connection in a new session
pub struct TcpDialer {
    addr: SocketAddr,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer for `addr`; every session it produces uses `handler`
    pub fn new(addr: SocketAddr, config: SessionConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            addr,
            config,
            handler,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Bound the TCP connect
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<Session, SessionError> {
        debug!("Dialing {}", self.addr);
        let stream = tokio::time::timeout(self.connect_timeout, connect_tcp(self.addr))
            .await
            .map_err(|_| {
                SessionError::Transport(anyhow::anyhow!(
                    "connect to {} timed out after {:?}",
                    self.addr,
                    self.connect_timeout
                ))
            })??;

        let transport = TcpTransport::new(stream)?;
        info!("TCP connection established to {}", self.addr);

        Ok(Session::builder(Arc::new(transport))
            .name(format!("client-{}", self.addr))
            .config(self.config.clone())
            .handler(self.handler.clone())
            .build())
    }
}

/// Accept connections until `shutdown` fires.
///
/// Every accepted connection becomes a started session registered under a
/// fresh id; sessions leave the registry when they close. On shutdown all
/// remaining sessions are closed.
pub async fn serve_tcp(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    shutdown: CancellationToken,
) -> Result<(), SessionError> {
    let local_addr = listener.local_addr()?;
    info!("Listening for sessions on {}", local_addr);
    let mut next_id: u64 = 0;

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed on {}: {}", local_addr, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let transport = match TcpTransport::new(stream) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to set up connection from {}: {}", peer, e);
                continue;
            }
        };

        next_id += 1;
        let id = next_id;
        let session = Session::builder(Arc::new(transport))
            .id(id)
            .name(format!("server-{}", id))
            .config(config.clone())
            .handler(handler.clone())
            .build();

        if !registry.register(id, session.clone()).await {
            warn!("Rejected connection from {} (registry full)", peer);
            let _ = session.close().await;
            continue;
        }

        if let Err(e) = session.start().await {
            warn!("Failed to start session {} from {}: {}", id, peer, e);
            registry.remove(id).await;
            let _ = session.close().await;
            continue;
        }
        info!("Accepted session {} from {}", id, peer);
    }

    info!(
        "Listener on {} shutting down, closing {} sessions",
        local_addr,
        registry.count().await
    );
    for (id, e) in registry.close_all().await {
        warn!("Failed to close session {} during shutdown: {}", id, e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;
    use conn_wire::{encode, MAX_PAYLOAD_SIZE};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn localhost() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr).await.unwrap();
        let transport = TcpTransport::new(stream).unwrap();
        assert_eq!(transport.peer_addr(), bound_addr);
        assert_eq!(transport.remote_addr(), bound_addr.to_string());
    }

    #[tokio::test]
    async fn test_tcp_transport_units() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            TcpTransport::new(connect_tcp(bound_addr).await.unwrap()).unwrap()
        });
        let (socket, _) = listener.accept().await.unwrap();
        let server = TcpTransport::new(socket).unwrap();
        let client = client.await.unwrap();

        client.write_unit(Bytes::from("hello")).await.unwrap();
        client.write_unit(Bytes::from("world")).await.unwrap();
        assert_eq!(server.read_unit().await.unwrap(), Bytes::from("hello"));
        assert_eq!(server.read_unit().await.unwrap(), Bytes::from("world"));

        // Close is idempotent and the peer sees EOF
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(
            server.read_unit().await,
            Err(SessionError::Wire(conn_wire::WireError::Io(_)))
        ));
        assert!(matches!(
            client.write_unit(Bytes::from("late")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_tcp_close_with_stalled_peer() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let client = TcpTransport::new(connect_tcp(bound_addr).await.unwrap()).unwrap();
        // Accepted but never read from
        let (_silent_peer, _) = listener.accept().await.unwrap();

        // Fill the socket buffers until a write stalls mid-flush
        let payload = Bytes::from(vec![0x5a; 64 * 1024]);
        let mut written = 0;
        loop {
            match timeout(Duration::from_millis(200), client.write_unit(payload.clone())).await {
                Ok(result) => {
                    result.unwrap();
                    written += 1;
                }
                Err(_) => break,
            }
        }
        assert!(written > 0);

        timeout(Duration::from_secs(3), client.close())
            .await
            .expect("close blocked on a peer that stopped reading")
            .unwrap();
        assert!(matches!(
            client.write_unit(Bytes::from("late")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_session_close_with_stalled_peer() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();
        let config = SessionConfig {
            queue_capacity: 4,
            write_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };

        let dialer = TcpDialer::new(bound_addr, config, RecordingHandler::new());
        let session = dialer.dial().await.unwrap();
        let (_silent_peer, _) = listener.accept().await.unwrap();
        session.start().await.unwrap();

        // Keep writing until backpressure starts dropping payloads
        let payload = Bytes::from(vec![0x5a; 64 * 1024]);
        while session.write(payload.clone()).await.is_ok() {}
        assert!(session.stats().dropped_writes > 0);

        timeout(Duration::from_secs(3), session.close())
            .await
            .expect("session close blocked on a stalled peer")
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_tcp_bad_length_is_protocol_violation() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let mut raw = connect_tcp(bound_addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let server = TcpTransport::new(socket).unwrap();

        raw.write_all(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        match server.read_unit().await {
            Err(SessionError::Wire(e)) => assert!(e.is_protocol_violation()),
            other => panic!("expected protocol violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serve_tcp_sessions() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let handler = RecordingHandler::new();
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve_tcp(
            listener,
            registry.clone(),
            SessionConfig::default(),
            handler.clone(),
            shutdown.clone(),
        ));

        // Raw client speaking the frame format
        let mut raw = connect_tcp(bound_addr).await.unwrap();
        raw.write_all(&encode(b"from-client").unwrap()).await.unwrap();
        assert_eq!(handler.next_data().await, Bytes::from("from-client"));
        assert_eq!(registry.count().await, 1);

        // Broadcast reaches the raw client as one frame
        assert_eq!(registry.broadcast("from-server").await, 1);
        let mut prefix = [0u8; 4];
        raw.read_exact(&mut prefix).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
        raw.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"from-server");

        // Peer hang-up removes the session from the registry
        drop(raw);
        timeout(Duration::from_secs(5), async {
            while registry.count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dialer_session() {
        let listener = listen_tcp(localhost()).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();
        let handler = RecordingHandler::new();

        let dialer = TcpDialer::new(bound_addr, SessionConfig::default(), handler.clone());
        let session = dialer.dial().await.unwrap();
        let (mut raw, _) = listener.accept().await.unwrap();
        session.start().await.unwrap();

        raw.write_all(&encode(b"pong").unwrap()).await.unwrap();
        assert_eq!(handler.next_data().await, Bytes::from("pong"));

        session.write("ping").await.unwrap();
        let mut frame = [0u8; 8];
        raw.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..], &encode(b"ping").unwrap()[..]);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = listen_tcp(localhost()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(addr, SessionConfig::default(), RecordingHandler::new());
        assert!(matches!(dialer.dial().await, Err(SessionError::Io(_))));
    }
}
