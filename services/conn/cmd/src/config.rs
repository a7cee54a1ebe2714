//! Configuration handling for the conn service.
//!
//! Values come from the shared reDB config file first, then `CONN_*`
//! environment variables. Command-line flags are applied last by `main`.

use anyhow::{bail, Context, Result};
use conn_session::{ReconnectConfig, SessionConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Conn service configuration
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Per-session timeouts and queue sizing
    pub session: SessionConfig,
    /// Client reconnection policy
    pub reconnect: ReconnectConfig,
    /// Heartbeat staleness threshold
    pub heartbeat_timeout: Duration,
    /// Interval between heartbeat scans
    pub heartbeat_interval: Duration,
    /// Consecutive misses before a session is evicted
    pub heartbeat_max_misses: u32,
    /// Registry capacity, 0 for unlimited
    pub max_sessions: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_max_misses: 3,
            max_sessions: 0,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    conn: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

/// Environment variable for every recognized config key
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("CONN_WRITE_TIMEOUT", "session.write_timeout"),
    ("CONN_READ_TIMEOUT", "session.read_timeout"),
    ("CONN_IDLE_TIMEOUT", "session.idle_timeout"),
    ("CONN_IDLE_CHECK_INTERVAL", "session.idle_check_interval"),
    ("CONN_QUEUE_CAPACITY", "session.queue_capacity"),
    ("CONN_MAX_SESSIONS", "session.max_sessions"),
    ("CONN_RECONNECT_ENABLED", "reconnect.enabled"),
    ("CONN_RECONNECT_DELAY", "reconnect.delay"),
    ("CONN_RECONNECT_MAX_ATTEMPTS", "reconnect.max_attempts"),
    ("CONN_HEARTBEAT_TIMEOUT", "heartbeat.timeout"),
    ("CONN_HEARTBEAT_INTERVAL", "heartbeat.interval"),
    ("CONN_HEARTBEAT_MAX_MISSES", "heartbeat.max_misses"),
];

impl ConnConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing or unparsable file falls back to defaults; a recognized key
    /// with an invalid value is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?}: {}, using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|name| std::env::var(name).ok())?;

        info!(
            "Final conn configuration: write_timeout={:?}, read_timeout={:?}, \
             idle_timeout={:?}, queue={}, reconnect={} ({:?}, max {}), heartbeat={:?}/{:?}",
            config.session.write_timeout,
            config.session.read_timeout,
            config.session.idle_timeout,
            config.session.queue_capacity,
            config.reconnect.enabled,
            config.reconnect.delay,
            config.reconnect.max_attempts,
            config.heartbeat_timeout,
            config.heartbeat_interval
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let entries = root
            .services
            .and_then(|services| services.conn)
            .and_then(|conn| conn.config)
            .unwrap_or_default();

        for (key, value) in entries {
            self.apply_key(&key, &value)?;
        }
        Ok(())
    }

    /// Apply `CONN_*` overrides through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var) {
                self.apply_key(key, &value)
                    .with_context(|| format!("invalid value for {}", var))?;
                info!("{} overridden by environment: {}", key, value);
            }
        }
        Ok(())
    }

    fn apply_key(&mut self, key: &str, value: &str) -> Result<()> {
        let key = key.strip_prefix("services.conn.").unwrap_or(key);
        match key {
            "session.write_timeout" => self.session.write_timeout = parse_duration(value)?,
            "session.read_timeout" => self.session.read_timeout = parse_duration(value)?,
            "session.idle_timeout" => self.session.idle_timeout = parse_duration(value)?,
            "session.idle_check_interval" => {
                self.session.idle_check_interval = parse_interval(value)?
            }
            "session.queue_capacity" => {
                self.session.queue_capacity = value
                    .parse()
                    .with_context(|| format!("invalid queue capacity {:?}", value))?
            }
            "session.max_sessions" => {
                self.max_sessions = value
                    .parse()
                    .with_context(|| format!("invalid max sessions {:?}", value))?
            }
            "reconnect.enabled" => self.reconnect.enabled = value.eq_ignore_ascii_case("true"),
            "reconnect.delay" => self.reconnect.delay = parse_duration(value)?,
            "reconnect.max_attempts" => {
                self.reconnect.max_attempts = value
                    .parse()
                    .with_context(|| format!("invalid max attempts {:?}", value))?
            }
            "heartbeat.timeout" => self.heartbeat_timeout = parse_duration(value)?,
            "heartbeat.interval" => self.heartbeat_interval = parse_interval(value)?,
            "heartbeat.max_misses" => {
                self.heartbeat_max_misses = value
                    .parse()
                    .with_context(|| format!("invalid max misses {:?}", value))?
            }
            _ => {
                // Ignore unknown configuration keys
            }
        }
        Ok(())
    }
}

fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration {:?}", value))
}

/// Like `parse_duration`, but a periodic interval may not be zero
fn parse_interval(value: &str) -> Result<Duration> {
    let interval = parse_duration(value)?;
    if interval.is_zero() {
        bail!("interval {:?} must be greater than zero", value);
    }
    Ok(interval)
}
