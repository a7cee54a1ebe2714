//! Heartbeat liveness tracking keyed by session id.
//!
//! Heartbeats are reported by the application (e.g. a ping message handled in
//! `on_data`), not inferred from transport I/O. A periodic scan flags ids
//! whose last heartbeat is older than the timeout. Entries are never removed
//! by the scan; the caller removes them once the session is known to be gone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scan interval used when a zero interval is requested
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Callback invoked with `(id, consecutive_misses)` for every timed-out id
pub type TimeoutCallback = Arc<dyn Fn(u64, u32) + Send + Sync>;

#[derive(Debug, Clone)]
struct HeartbeatEntry {
    /// Timestamp of the last heartbeat
    last_heartbeat: Instant,
    /// Number of consecutive scans that found this entry stale
    miss_count: u32,
}

/// Tracks heartbeats per session id
pub struct HeartbeatTracker {
    /// Entries per session id
    entries: RwLock<HashMap<u64, HeartbeatEntry>>,
    /// Staleness threshold
    timeout: Duration,
    /// Fired outside the lock for every stale id found by a scan
    on_timeout: Option<TimeoutCallback>,
}

impl fmt::Debug for HeartbeatTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatTracker")
            .field("timeout", &self.timeout)
            .field("has_callback", &self.on_timeout.is_some())
            .finish()
    }
}

impl HeartbeatTracker {
    /// Create a tracker with the given heartbeat timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
            on_timeout: None,
        }
    }

    /// Register the timeout callback
    pub fn with_timeout_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u32) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(callback));
        self
    }

    /// Configured heartbeat timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat, creating the entry if needed and resetting misses
    pub async fn update_heartbeat(&self, id: u64) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        let entry = entries.entry(id).or_insert(HeartbeatEntry {
            last_heartbeat: now,
            miss_count: 0,
        });
        if entry.miss_count > 0 {
            debug!(
                "Heartbeat resumed for session {} after {} misses",
                id, entry.miss_count
            );
        }
        entry.last_heartbeat = now;
        entry.miss_count = 0;
    }

    /// Stop tracking an id; false if it was unknown
    pub async fn remove(&self, id: u64) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    /// Scan for stale entries.
    ///
    /// Every entry older than the timeout has its miss count incremented and
    /// its id returned. The callback, if any, is spawned once per id after the
    /// lock is released.
    pub async fn check_timeouts(&self) -> Vec<u64> {
        let timed_out: Vec<(u64, u32)> = {
            let mut entries = self.entries.write().await;
            let now = Instant::now();

            entries
                .iter_mut()
                .filter(|(_, entry)| now.duration_since(entry.last_heartbeat) > self.timeout)
                .map(|(id, entry)| {
                    entry.miss_count += 1;
                    (*id, entry.miss_count)
                })
                .collect()
        };

        for (id, misses) in &timed_out {
            warn!("Heartbeat timeout for session {} (misses: {})", id, misses);
            if let Some(callback) = &self.on_timeout {
                let callback = callback.clone();
                let (id, misses) = (*id, *misses);
                tokio::spawn(async move { callback(id, misses) });
            }
        }

        timed_out.into_iter().map(|(id, _)| id).collect()
    }

    /// Consecutive misses for an id
    pub async fn miss_count(&self, id: u64) -> Option<u32> {
        self.entries.read().await.get(&id).map(|entry| entry.miss_count)
    }

    /// Time of the last heartbeat for an id
    pub async fn last_heartbeat(&self, id: u64) -> Option<Instant> {
        self.entries.read().await.get(&id).map(|entry| entry.last_heartbeat)
    }

    /// Number of tracked ids
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no id is tracked
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Run `check_timeouts` every `interval` until the returned handle stops it.
    ///
    /// A zero interval falls back to one scan per second.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> MonitorHandle {
        let interval = if interval.is_zero() {
            warn!(
                "Heartbeat scan interval must be non-zero, using {:?}",
                DEFAULT_SCAN_INTERVAL
            );
            DEFAULT_SCAN_INTERVAL
        } else {
            interval
        };
        let stop = CancellationToken::new();
        let tracker = self.clone();
        let task_stop = stop.clone();

        let task = tokio::spawn(async move {
            info!(
                "Heartbeat monitor started (interval: {:?}, timeout: {:?})",
                interval, tracker.timeout
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = task_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.check_timeouts().await;
                    }
                }
            }
            info!("Heartbeat monitor stopped");
        });

        MonitorHandle { stop, task }
    }
}

/// Stop handle for a heartbeat monitor
#[derive(Debug)]
pub struct MonitorHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the monitor to stop after its current scan
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether a stop was signaled
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop the monitor and wait for it to exit
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!("Heartbeat monitor task failed: {}", e);
        }
    }
}
