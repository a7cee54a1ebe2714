//! In-memory transport and recording handler shared by the unit tests.

use crate::error::SessionError;
use crate::session::{Session, SessionHandler};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Transport whose inbound side is fed by a channel and whose outbound side
/// is recorded in memory
pub(crate) struct MockTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    written: Mutex<Vec<Bytes>>,
    write_notify: Notify,
    close_calls: AtomicUsize,
    stall_writes: AtomicBool,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
}

/// Create a mock transport and the sender that feeds its reads.
///
/// Dropping the sender makes the next read fail like a peer hang-up.
pub(crate) fn mock_transport() -> (Arc<MockTransport>, mpsc::UnboundedSender<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        inbound: tokio::sync::Mutex::new(rx),
        written: Mutex::new(Vec::new()),
        write_notify: Notify::new(),
        close_calls: AtomicUsize::new(0),
        stall_writes: AtomicBool::new(false),
        fail_writes: AtomicBool::new(false),
        fail_close: AtomicBool::new(false),
    });
    (transport, tx)
}

impl MockTransport {
    pub(crate) fn written(&self) -> Vec<Bytes> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Block every write forever
    pub(crate) fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Fail every write with a broken pipe
    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Fail every close after counting it
    pub(crate) fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn wait_for_writes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.write_notify.notified();
                if self.written.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for writes");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_unit(&self) -> Result<Bytes, SessionError> {
        self.inbound.lock().await.recv().await.ok_or_else(|| {
            SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer hung up",
            ))
        })
    }

    async fn write_unit(&self, payload: Bytes) -> Result<(), SessionError> {
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        self.written.lock().unwrap().push(payload);
        self.write_notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(SessionError::Transport(anyhow::anyhow!("close failed")));
        }
        Ok(())
    }

    fn remote_addr(&self) -> String {
        "mock:0".to_string()
    }
}

/// Handler that forwards received units to a channel and counts callbacks
pub(crate) struct RecordingHandler {
    data_tx: mpsc::UnboundedSender<Bytes>,
    data_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    fail_on: Option<Bytes>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    errors: AtomicUsize,
    close_notify: Notify,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Reject units equal to `payload` from `on_data`
    pub(crate) fn failing_on(payload: &'static str) -> Arc<Self> {
        Self::build(Some(Bytes::from(payload)))
    }

    fn build(fail_on: Option<Bytes>) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            data_tx,
            data_rx: tokio::sync::Mutex::new(data_rx),
            fail_on,
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            close_notify: Notify::new(),
        })
    }

    pub(crate) async fn next_data(&self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.data_rx.lock().await.recv().await
        })
        .await
        .expect("timed out waiting for data")
        .expect("data channel closed")
    }

    pub(crate) async fn wait_for_close(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.close_notify.notified();
                if self.closes() > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for on_close");
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn on_connect(&self, _session: &Session) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_data(&self, _session: &Session, data: Bytes) -> anyhow::Result<()> {
        let _ = self.data_tx.send(data.clone());
        if self.fail_on.as_ref() == Some(&data) {
            anyhow::bail!("rejected {:?}", data);
        }
        Ok(())
    }

    async fn on_close(&self, _session: &Session) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.close_notify.notify_waiters();
        Ok(())
    }

    fn on_error(&self, _session: &Session, _error: &SessionError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}
