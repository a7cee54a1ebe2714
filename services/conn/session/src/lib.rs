//! Transport-agnostic sessions, fan-out registry, heartbeats and reconnection for conn.
//!
//! This crate provides the connection core: a session drives any message
//! transport through a bounded outbound queue and independent read, write and
//! idle-check tasks, all cancelled through one shared token.
//!
//! ## Features
//!
//! - **Session**: `Created → Running → Closed` lifecycle with backpressure and idempotent close
//! - **Registry**: id-keyed session set with broadcast and aggregate counters
//! - **Heartbeat**: application-level liveness tracking with periodic scans
//! - **Reconnect**: client wrapper that redials with a fixed delay
//! - **TCP**: length-prefixed transport adapter, accept loop and dialer
//!
//! ## Example
//!
//! ```rust,no_run
//! use conn_session::{
//!     ReconnectConfig, ReconnectingClient, Session, SessionConfig, SessionHandler, TcpDialer,
//! };
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl SessionHandler for Printer {
//!     async fn on_data(&self, session: &Session, data: Bytes) -> anyhow::Result<()> {
//!         println!("{}: {} bytes", session.name(), data.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let addr = "127.0.0.1:9000".parse()?;
//! let dialer = TcpDialer::new(addr, SessionConfig::default(), Arc::new(Printer));
//! let client = ReconnectingClient::new(dialer, ReconnectConfig::default());
//!
//! client.start().await?;
//! client.write("hello").await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use error::SessionError;
pub use heartbeat::{HeartbeatTracker, MonitorHandle, TimeoutCallback};
pub use reconnect::{ClientHandler, ClientState, Dialer, ReconnectConfig, ReconnectingClient};
pub use registry::{RegistryStats, SessionRegistry};
pub use session::{
    Session, SessionBuilder, SessionConfig, SessionHandler, SessionState, SessionStats,
};
pub use transport::{connect_tcp, listen_tcp, serve_tcp, TcpDialer, TcpTransport, Transport};
