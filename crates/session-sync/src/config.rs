//! # Configuration
//!
//! [`SyncConfig`] holds everything either side of the link needs: where to
//! connect or bind, where the credential lives, and the reconnect, heartbeat,
//! timeout and acknowledgment tunables.
//!
//! ## Loading Priority
//!
//! 1. TOML config file at an explicit path
//! 2. `SESSION_SYNC_CONFIG` environment variable
//! 3. `./session-sync.toml` in the current directory
//! 4. `~/.config/session-sync/session-sync.toml`
//! 5. Built-in defaults
//!
//! `SESSION_SYNC_URL` and `SESSION_SYNC_BIND` override the corresponding
//! fields whichever source was used.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Default backend WebSocket URL.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

/// Default backend listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "SESSION_SYNC_CONFIG";

/// Environment variable overriding [`SyncConfig::server_url`].
pub const SERVER_URL_ENV: &str = "SESSION_SYNC_URL";

/// Environment variable overriding [`SyncConfig::bind_addr`].
pub const BIND_ADDR_ENV: &str = "SESSION_SYNC_BIND";

const CONFIG_FILE_NAME: &str = "session-sync.toml";

const DEFAULT_RECONNECT_CAP_SECS: u64 = 30;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 20;
const DEFAULT_RECONNECT_JITTER: f64 = 0.25;

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 45;
const DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER: u32 = 2;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 25;

const DEFAULT_MAX_BUFFERED_PER_CLIENT: usize = 1000;
const DEFAULT_ACK_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Configuration shared by the client and the backend.
///
/// ```
/// use session_sync::config::SyncConfig;
///
/// let config = SyncConfig::default();
/// assert_eq!(config.server_url, "ws://127.0.0.1:8080");
/// assert_eq!(config.heartbeat.timeout().as_secs(), 90);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// WebSocket URL the client connects to.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Address the backend listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Credential file location. Defaults to the per-user config directory.
    #[serde(default)]
    pub credential_path: Option<PathBuf>,

    /// Stable identity of this client across sockets. A random id is
    /// generated per process when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub ack: AckConfig,
}

/// Automatic reconnection after a transient failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound of the pre-jitter delay, in seconds.
    #[serde(default = "default_reconnect_cap")]
    pub cap_secs: u64,

    /// Consecutive failed attempts before giving up. 0 means unlimited.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,

    /// Relative jitter applied to every delay.
    #[serde(default = "default_reconnect_jitter")]
    pub jitter: f64,
}

/// Heartbeat beacon and zombie detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server beacons, in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Missed intervals before the client declares the link a zombie.
    #[serde(default = "default_heartbeat_multiplier")]
    pub timeout_multiplier: u32,
}

/// Timeouts for connection setup and lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP + WebSocket upgrade, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// From socket open until the state sync arrives, in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_secs: u64,

    /// How long a backgrounded client waits for its locks to clear.
    #[serde(default = "default_drain_timeout")]
    pub drain_secs: u64,
}

/// Server-side acknowledgment buffer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfig {
    /// Unacknowledged messages kept per client before the oldest is dropped.
    #[serde(default = "default_max_buffered")]
    pub max_buffered_per_client: usize,

    /// How long a disconnected client's messages are kept for it to return.
    #[serde(default = "default_ack_retention")]
    pub retention_secs: u64,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_cap() -> u64 {
    DEFAULT_RECONNECT_CAP_SECS
}

fn default_reconnect_max_attempts() -> u32 {
    DEFAULT_RECONNECT_MAX_ATTEMPTS
}

fn default_reconnect_jitter() -> f64 {
    DEFAULT_RECONNECT_JITTER
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_heartbeat_multiplier() -> u32 {
    DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

fn default_max_buffered() -> usize {
    DEFAULT_MAX_BUFFERED_PER_CLIENT
}

fn default_ack_retention() -> u64 {
    DEFAULT_ACK_RETENTION_SECS
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            bind_addr: default_bind_addr(),
            credential_path: None,
            client_id: None,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            timeouts: TimeoutConfig::default(),
            ack: AckConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cap_secs: DEFAULT_RECONNECT_CAP_SECS,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            timeout_multiplier: DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            handshake_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            drain_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            max_buffered_per_client: DEFAULT_MAX_BUFFERED_PER_CLIENT,
            retention_secs: DEFAULT_ACK_RETENTION_SECS,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Silence after which the client treats the link as dead.
    pub fn timeout(&self) -> Duration {
        self.interval().saturating_mul(self.timeout_multiplier.max(1))
    }
}

impl AckConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

// ─── SyncConfig impl ───────────────────────────────────────────────────

impl SyncConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load config from a TOML file, with environment variable overrides.
    ///
    /// # Errors
    /// [`SyncError::ConfigError`] if the file cannot be read or parsed, or
    /// if the crate was built without the `config-toml` feature.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| SyncError::ConfigError {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse config from TOML text without consulting the environment.
    ///
    /// # Errors
    /// [`SyncError::ConfigError`] on malformed input.
    #[cfg(feature = "config-toml")]
    pub fn from_toml_str(contents: &str) -> SyncResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Parse config from TOML text without consulting the environment.
    ///
    /// # Errors
    /// Always fails: TOML support is compiled out.
    #[cfg(not(feature = "config-toml"))]
    pub fn from_toml_str(_contents: &str) -> SyncResult<Self> {
        Err(SyncError::ConfigError {
            reason: "TOML config support requires the `config-toml` feature".into(),
        })
    }

    /// Discover and load config from the standard search path.
    ///
    /// # Errors
    /// Propagates [`SyncConfig::from_file`] errors for a file that exists
    /// but cannot be loaded. A missing file is not an error.
    pub fn discover(explicit_path: Option<&Path>) -> SyncResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(user_path) = dirs_config_path() {
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Ok(Self::from_env())
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(SERVER_URL_ENV) {
            self.server_url = url;
        }
        if let Some(bind) = lookup(BIND_ADDR_ENV) {
            self.bind_addr = bind;
        }
    }

    /// Reject values that would make the protocol misbehave.
    ///
    /// # Errors
    /// [`SyncError::ConfigError`] naming the offending field.
    pub fn validate(&self) -> SyncResult<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(SyncError::ConfigError {
                reason: format!(
                    "server_url must be a ws:// or wss:// URL, got '{}'",
                    self.server_url
                ),
            });
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(SyncError::ConfigError {
                reason: "heartbeat.interval_secs must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(SyncError::ConfigError {
                reason: format!(
                    "reconnect.jitter must be within 0..=1, got {}",
                    self.reconnect.jitter
                ),
            });
        }
        if self.ack.max_buffered_per_client == 0 {
            return Err(SyncError::ConfigError {
                reason: "ack.max_buffered_per_client must be at least 1".into(),
            });
        }
        if self.ack.retention_secs == 0 {
            return Err(SyncError::ConfigError {
                reason: "ack.retention_secs must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Platform-appropriate config file path.
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("session-sync").join(CONFIG_FILE_NAME))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("session-sync")
                .join(CONFIG_FILE_NAME)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.cap_secs, 30);
        assert_eq!(config.reconnect.max_attempts, 20);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(45));
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(90));
        assert_eq!(config.timeouts.drain(), Duration::from_secs(25));
        assert_eq!(config.ack.max_buffered_per_client, 1000);
        assert_eq!(config.ack.retention(), Duration::from_secs(86_400));
        config.validate().unwrap();
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
server_url = "ws://10.0.0.5:9000"

[heartbeat]
interval_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.server_url, "ws://10.0.0.5:9000");
        assert_eq!(config.heartbeat.interval_secs, 5);
        assert_eq!(config.heartbeat.timeout_multiplier, 2);
        assert_eq!(config.reconnect.cap_secs, 30);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = SyncConfig::from_toml_str("server_url = [").unwrap_err();
        assert!(matches!(err, SyncError::ConfigError { .. }));
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut original = SyncConfig::default();
        original.client_id = Some("tablet-7".into());
        original.ack.max_buffered_per_client = 50;
        std::fs::write(&path, toml::to_string(&original).unwrap()).unwrap();

        let loaded = SyncConfig::from_file(&path).unwrap();
        assert_eq!(loaded.client_id.as_deref(), Some("tablet-7"));
        assert_eq!(loaded.ack.max_buffered_per_client, 50);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncConfig::discover(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_overrides_replace_url_and_bind() {
        let vars: HashMap<&str, &str> = [
            (SERVER_URL_ENV, "ws://override:1"),
            (BIND_ADDR_ENV, "0.0.0.0:9999"),
        ]
        .into_iter()
        .collect();
        let mut config = SyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.server_url, "ws://override:1");
        assert_eq!(config.bind_addr, "0.0.0.0:9999");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig {
            server_url: "http://nope".into(),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        config.server_url = DEFAULT_SERVER_URL.into();
        config.reconnect.jitter = 1.5;
        assert!(config.validate().is_err());

        config.reconnect.jitter = 0.25;
        config.heartbeat.interval_secs = 0;
        assert!(config.validate().is_err());

        config.heartbeat.interval_secs = 45;
        config.ack.retention_secs = 0;
        assert!(config.validate().is_err());
    }
}
