//! Session registry for fan-out across many sessions.
//!
//! One registry is created per listening transport. It owns the id → session
//! map and aggregate counters; broadcast writes go through each session's own
//! bounded queue, so a slow peer only ever delays itself.

use crate::error::SessionError;
use crate::session::Session;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Aggregate registry statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions currently registered
    pub current_count: usize,
    /// Sessions ever accepted by `add`
    pub total_accepted: u64,
    /// Sessions rejected by `add` (duplicate id, closed, or over capacity)
    pub total_rejected: u64,
    /// Broadcast operations performed
    pub total_messages: u64,
    /// Payload bytes broadcast, counted once per broadcast
    pub total_bytes: u64,
}

/// Registry of live sessions keyed by id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Active sessions by id
    sessions: RwLock<HashMap<u64, Session>>,
    /// Maximum number of sessions, 0 for unlimited
    max_sessions: usize,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl SessionRegistry {
    /// Create an unbounded registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that rejects sessions beyond `max_sessions`
    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            ..Self::default()
        }
    }

    /// Add a session under `id`; returns false if it was rejected
    pub async fn add(&self, id: u64, session: Session) -> bool {
        let mut sessions = self.sessions.write().await;

        let reason = if sessions.contains_key(&id) {
            Some("duplicate id")
        } else if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            Some("registry full")
        } else if session.set_id(id).is_err() {
            Some("session closed")
        } else {
            None
        };

        if let Some(reason) = reason {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejected session {}: {}", id, reason);
            return false;
        }

        sessions.insert(id, session);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        debug!("Registered session {} ({} active)", id, sessions.len());
        true
    }

    /// Add a session and drop it from the registry once it closes
    pub async fn register(self: &Arc<Self>, id: u64, session: Session) -> bool {
        if !self.add(id, session.clone()).await {
            return false;
        }

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_same(id, &session).await;
            }
        });
        true
    }

    async fn remove_if_same(&self, id: u64, session: &Session) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&id).is_some_and(|current| current.ptr_eq(session)) {
            sessions.remove(&id);
            debug!("Session {} closed, removed from registry", id);
        }
    }

    /// Remove a session without closing it
    pub async fn remove(&self, id: u64) -> Option<Session> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            debug!("Unregistered session {}", id);
        }
        removed
    }

    /// Look up a session
    pub async fn get(&self, id: u64) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Snapshot of all registered sessions
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Number of registered sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Write `payload` to every session; returns how many accepted it
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> usize {
        self.fan_out(payload.into(), None).await
    }

    /// Write `payload` to every session except `exclude`
    pub async fn broadcast_exclude(&self, payload: impl Into<Bytes>, exclude: u64) -> usize {
        self.fan_out(payload.into(), Some(exclude)).await
    }

    async fn fan_out(&self, payload: Bytes, exclude: Option<u64>) -> usize {
        if payload.is_empty() {
            return 0;
        }

        let targets: Vec<(u64, Session)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, session)| (*id, session.clone()))
                .collect()
        };

        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let results = join_all(
            targets
                .iter()
                .map(|(_, session)| session.write(payload.clone())),
        )
        .await;

        let mut delivered = 0;
        for ((id, _), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to session {} failed: {}", id, e),
            }
        }

        debug!(
            "Broadcast {} bytes to {}/{} sessions",
            payload.len(),
            delivered,
            targets.len()
        );
        delivered
    }

    /// Write to one session; false if the id is unknown or the write failed
    pub async fn send_to(&self, id: u64, payload: impl Into<Bytes>) -> bool {
        let Some(session) = self.get(id).await else {
            debug!("send_to: no session {}", id);
            return false;
        };

        match session.write(payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("send_to session {} failed: {}", id, e);
                false
            }
        }
    }

    /// Close every registered session and empty the registry.
    ///
    /// The sessions are taken out under the write lock and closed outside it,
    /// so a session added while the sweep runs stays registered. Individual
    /// close failures do not stop the sweep; they are returned to the caller.
    pub async fn close_all(&self) -> Vec<(u64, SessionError)> {
        let targets: Vec<(u64, Session)> =
            std::mem::take(&mut *self.sessions.write().await).into_iter().collect();

        let results = join_all(targets.iter().map(|(_, session)| session.close())).await;

        let failures: Vec<(u64, SessionError)> = targets
            .iter()
            .zip(results)
            .filter_map(|((id, _), result)| result.err().map(|e| (*id, e)))
            .collect();

        info!(
            "Closed {} sessions ({} failures)",
            targets.len(),
            failures.len()
        );
        failures
    }

    /// Aggregate statistics
    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            current_count: self.count().await,
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, SessionHandler};
    use crate::testing::{mock_transport, MockTransport, RecordingHandler};
    use async_trait::async_trait;
    use std::time::Duration;

    fn new_session(transport: Arc<MockTransport>) -> Session {
        Session::builder(transport)
            .config(SessionConfig::default())
            .handler(RecordingHandler::new())
            .build()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (t1, _p1) = mock_transport();
        let (t2, _p2) = mock_transport();
        let s1 = new_session(t1.clone());
        let s2 = new_session(t2.clone());
        s1.start().await.unwrap();
        s2.start().await.unwrap();

        assert!(registry.add(1, s1).await);
        assert!(registry.add(2, s2).await);

        assert_eq!(registry.broadcast("payload").await, 2);
        t1.wait_for_writes(1).await;
        t2.wait_for_writes(1).await;
        assert_eq!(t1.written(), vec![Bytes::from("payload")]);
        assert_eq!(t2.written(), vec![Bytes::from("payload")]);

        let stats = registry.stats().await;
        assert_eq!(stats.current_count, 2);
        assert_eq!(stats.total_accepted, 2);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.total_bytes, "payload".len() as u64);
    }

    #[tokio::test]
    async fn test_broadcast_exclude_and_send_to() {
        let registry = SessionRegistry::new();
        let (t1, _p1) = mock_transport();
        let (t2, _p2) = mock_transport();
        let s1 = new_session(t1.clone());
        let s2 = new_session(t2.clone());
        s1.start().await.unwrap();
        s2.start().await.unwrap();
        registry.add(1, s1).await;
        registry.add(2, s2).await;

        assert_eq!(registry.broadcast_exclude("not-for-1", 1).await, 1);
        assert!(registry.send_to(1, "direct").await);
        assert!(!registry.send_to(99, "nobody").await);

        t1.wait_for_writes(1).await;
        t2.wait_for_writes(1).await;
        assert_eq!(t1.written(), vec![Bytes::from("direct")]);
        assert_eq!(t2.written(), vec![Bytes::from("not-for-1")]);
    }

    #[tokio::test]
    async fn test_add_rejections() {
        let registry = SessionRegistry::with_max_sessions(2);
        let (t1, _p1) = mock_transport();
        let (t2, _p2) = mock_transport();
        let (t3, _p3) = mock_transport();
        let (t4, _p4) = mock_transport();

        assert!(registry.add(1, new_session(t1)).await);
        assert!(!registry.add(1, new_session(t2.clone())).await);
        assert!(registry.add(2, new_session(t2)).await);
        assert!(!registry.add(3, new_session(t3)).await);

        let closed = new_session(t4);
        closed.close().await.unwrap();
        registry.remove(2).await.unwrap();
        assert!(!registry.add(4, closed).await);

        let stats = registry.stats().await;
        assert_eq!(stats.current_count, 1);
        assert_eq!(stats.total_accepted, 2);
        assert_eq!(stats.total_rejected, 3);
    }

    #[tokio::test]
    async fn test_add_assigns_id() {
        let registry = SessionRegistry::new();
        let (t1, _p1) = mock_transport();
        registry.add(7, new_session(t1)).await;

        let session = registry.get(7).await.unwrap();
        assert_eq!(session.id(), 7);
        assert!(registry.get(8).await.is_none());
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_removes_closed_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let (t1, _p1) = mock_transport();
        let session = new_session(t1);
        session.start().await.unwrap();
        assert!(registry.register(5, session.clone()).await);

        session.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.count().await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(registry.get(5).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let (t1, _p1) = mock_transport();
        let (t2, _p2) = mock_transport();
        let s1 = new_session(t1.clone());
        let s2 = new_session(t2.clone());
        s1.start().await.unwrap();
        registry.add(1, s1.clone()).await;
        registry.add(2, s2.clone()).await;

        let failures = registry.close_all().await;
        assert!(failures.is_empty());
        assert!(s1.is_closed());
        assert!(s2.is_closed());
        assert_eq!(t1.close_calls(), 1);
        assert_eq!(t2.close_calls(), 1);
        assert_eq!(registry.count().await, 0);
        assert_eq!(registry.broadcast("into the void").await, 0);
    }

    #[tokio::test]
    async fn test_close_all_reports_failures() {
        let registry = SessionRegistry::new();
        let (t1, _p1) = mock_transport();
        let (t2, _p2) = mock_transport();
        let (t3, _p3) = mock_transport();
        t2.fail_close();
        let sessions = [
            new_session(t1.clone()),
            new_session(t2.clone()),
            new_session(t3.clone()),
        ];
        for (id, session) in (1..).zip(sessions.iter()) {
            session.start().await.unwrap();
            assert!(registry.add(id, session.clone()).await);
        }

        let failures = registry.close_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 2);
        assert!(matches!(failures[0].1, SessionError::Transport(_)));

        // A failing close still marks the session closed and never stops the sweep
        assert!(sessions.iter().all(|session| session.is_closed()));
        assert_eq!(t1.close_calls(), 1);
        assert_eq!(t2.close_calls(), 1);
        assert_eq!(t3.close_calls(), 1);
        assert_eq!(registry.count().await, 0);
    }

    /// Registers a waiting session from inside `on_close`
    struct LateJoiner {
        registry: Arc<SessionRegistry>,
        late: std::sync::Mutex<Option<Session>>,
    }

    #[async_trait]
    impl SessionHandler for LateJoiner {
        async fn on_data(&self, _session: &Session, _data: Bytes) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_close(&self, _session: &Session) -> anyhow::Result<()> {
            let late = self.late.lock().unwrap().take();
            if let Some(late) = late {
                assert!(self.registry.add(2, late).await);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_added_during_close_all_survives() {
        let registry = Arc::new(SessionRegistry::new());
        let (t1, _p1) = mock_transport();
        let (t2, _p2) = mock_transport();
        let late = new_session(t2.clone());

        let first = Session::builder(t1.clone())
            .config(SessionConfig::default())
            .handler(Arc::new(LateJoiner {
                registry: registry.clone(),
                late: std::sync::Mutex::new(Some(late.clone())),
            }))
            .build();
        first.start().await.unwrap();
        assert!(registry.add(1, first.clone()).await);

        let failures = registry.close_all().await;
        assert!(failures.is_empty());
        assert!(first.is_closed());

        assert_eq!(registry.count().await, 1);
        assert!(registry.get(2).await.unwrap().ptr_eq(&late));
        assert!(!late.is_closed());
        assert_eq!(t2.close_calls(), 0);
    }
}
