//! Session error types.

use conn_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by sessions, the registry and the reconnecting client
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session is closed
    #[error("session closed")]
    Closed,

    /// Empty payloads are never queued
    #[error("empty payload")]
    EmptyPayload,

    /// Outbound queue stayed full for the whole write timeout; payload dropped
    #[error("write timed out after {0:?}, payload dropped")]
    WriteTimeout(Duration),

    /// Session was cancelled while waiting for queue space; payload dropped
    #[error("session cancelled, payload dropped")]
    Cancelled,

    /// `start` was called on a session that is already running
    #[error("session already started")]
    AlreadyStarted,

    /// Session has no data handler attached
    #[error("no data handler configured")]
    MissingHandler,

    /// Reconnecting client currently has no live session
    #[error("not connected")]
    NotConnected,

    /// No unit arrived within the read timeout
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Framing failure on a byte-stream transport
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport adapter failure
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    /// Data handler rejected a unit
    #[error("handler error: {0:#}")]
    Handler(anyhow::Error),
}

impl SessionError {
    /// Whether the payload passed to `write` was dropped by backpressure
    pub fn is_dropped_write(&self) -> bool {
        matches!(self, SessionError::WriteTimeout(_) | SessionError::Cancelled)
    }
}
