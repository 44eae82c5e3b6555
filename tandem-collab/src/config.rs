//! Server and coordinator configuration.
//!
//! Every knob has a default; [`ServerConfig::from_env`] overrides them from
//! `TANDEM_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Knobs of the session coordinator and document registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Attached sessions accepted before readiness reports capacity
    pub max_sessions: usize,
    /// Operations buffered per session before it is forced into resync
    pub delivery_capacity: usize,
    /// Largest revision gap replayed as catch-up instead of a snapshot
    pub catch_up_threshold: u64,
    /// History entries kept in memory per document
    pub max_history: usize,
    /// Accepted operations between two pushed snapshots
    pub snapshot_interval: u64,
    /// Minimum spacing of broadcast presence updates per client
    pub presence_interval: Duration,
    /// Presence records expire after this much silence
    pub presence_timeout: Duration,
    /// Sessions expire after this much silence
    pub idle_session_timeout: Duration,
    /// Zero-session documents stay resident this long
    pub eviction_grace: Duration,
    /// Period of the expiry/eviction sweep
    pub sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1_000,
            delivery_capacity: 256,
            catch_up_threshold: 500,
            max_history: 10_000,
            snapshot_interval: 100,
            presence_interval: Duration::from_millis(50),
            presence_timeout: Duration::from_secs(30),
            idle_session_timeout: Duration::from_secs(120),
            eviction_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address of the WebSocket sync endpoint
    pub bind_addr: String,
    /// Address of the HTTP health endpoints
    pub health_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            health_addr: "127.0.0.1:9091".to_string(),
            storage_path: None,
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `TANDEM_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("TANDEM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(addr) = lookup("TANDEM_HEALTH_ADDR") {
            config.health_addr = addr;
        }
        if let Some(path) = lookup("TANDEM_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }

        let sync = &mut config.sync;
        override_with(&lookup, "TANDEM_MAX_SESSIONS", &mut sync.max_sessions)?;
        override_with(&lookup, "TANDEM_DELIVERY_CAPACITY", &mut sync.delivery_capacity)?;
        override_with(&lookup, "TANDEM_CATCH_UP_THRESHOLD", &mut sync.catch_up_threshold)?;
        override_with(&lookup, "TANDEM_MAX_HISTORY", &mut sync.max_history)?;
        override_with(&lookup, "TANDEM_SNAPSHOT_INTERVAL", &mut sync.snapshot_interval)?;
        override_millis(&lookup, "TANDEM_PRESENCE_INTERVAL_MS", &mut sync.presence_interval)?;
        override_secs(&lookup, "TANDEM_PRESENCE_TIMEOUT_SECS", &mut sync.presence_timeout)?;
        override_secs(&lookup, "TANDEM_IDLE_TIMEOUT_SECS", &mut sync.idle_session_timeout)?;
        override_secs(&lookup, "TANDEM_EVICTION_GRACE_SECS", &mut sync.eviction_grace)?;
        override_secs(&lookup, "TANDEM_SWEEP_INTERVAL_SECS", &mut sync.sweep_interval)?;

        if sync.delivery_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "TANDEM_DELIVERY_CAPACITY",
                value: "0".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn override_with<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = parse(lookup, key)? {
        *slot = value;
    }
    Ok(())
}

fn override_secs<F>(lookup: &F, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(secs) = parse::<F, u64>(lookup, key)? {
        *slot = Duration::from_secs(secs);
    }
    Ok(())
}

fn override_millis<F>(lookup: &F, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ms) = parse::<F, u64>(lookup, key)? {
        *slot = Duration::from_millis(ms);
    }
    Ok(())
}
