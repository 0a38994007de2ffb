//! # Error Types
//!
//! Semantic error types for the session synchronization protocol. Variants
//! are grouped by how the caller is expected to react:
//!
//! | Category | Variants | Reaction |
//! |----------|----------|----------|
//! | Authentication | [`SyncError::AuthenticationFailed`] | Terminal, needs a new credential |
//! | Transient network | `ConnectionFailed`, `ConnectionLost`, `WebSocket`, `Timeout` | Absorbed by the reconnector |
//! | Zombie connection | [`SyncError::ZombieConnection`] | Same as transient |
//! | Busy | [`SyncError::Busy`] | Expected outcome, caller retries |
//! | Fatal local | `CredentialStore`, `ConfigError` | Surfaced, operator action required |

use thiserror::Error;

/// Convenient Result alias for session-sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// All errors that can occur on either side of the sync link.
#[derive(Error, Debug)]
pub enum SyncError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to establish a WebSocket connection to the backend.
    #[error("Failed to connect to backend at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// WebSocket connection was lost after being established.
    #[error("Connection to backend lost: {reason}")]
    ConnectionLost { reason: String },

    /// The client is not connected to the backend.
    #[error("Not connected to backend")]
    NotConnected,

    /// The transport stayed open but heartbeats stopped arriving.
    #[error("No heartbeat received for {silent_secs}s, connection is a zombie")]
    ZombieConnection { silent_secs: u64 },

    /// Automatic reconnection gave up after the configured attempt count.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // ─── Authentication ─────────────────────────────────────────────
    /// The backend rejected the credential. Not retried automatically.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// A credential does not have the expected prefix or length.
    #[error("Invalid credential format: {reason}")]
    InvalidCredential { reason: String },

    /// The on-disk credential store is missing, unreadable, or corrupted.
    #[error("Credential store error at {path}: {reason}")]
    CredentialStore { path: String, reason: String },

    // ─── Sessions ───────────────────────────────────────────────────
    /// The session is already locked by an in-flight unit of work.
    #[error("Session {session_id} is busy")]
    Busy { session_id: String },

    /// The backend reported a failure for a unit of work.
    #[error("Session {session_id} failed: {message}")]
    WorkFailed { session_id: String, message: String },

    // ─── Timeout ────────────────────────────────────────────────────
    /// An operation timed out.
    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    // ─── Protocol ───────────────────────────────────────────────────
    /// Received an unexpected or malformed message.
    #[error("Protocol error: {reason}")]
    ProtocolError { reason: String },

    // ─── Config ─────────────────────────────────────────────────────
    /// Configuration file error (missing, malformed, or invalid values).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── WebSocket ──────────────────────────────────────────────────
    /// Low-level WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ─── I/O ────────────────────────────────────────────────────────
    /// Filesystem or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Returns `true` if this error is transient and the reconnector should
    /// absorb it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed { .. }
                | SyncError::ConnectionLost { .. }
                | SyncError::ZombieConnection { .. }
                | SyncError::Timeout { .. }
                | SyncError::WebSocket(_)
        )
    }

    /// Returns `true` if this error indicates the connection is dead
    /// and a reconnect is needed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed { .. }
                | SyncError::ConnectionLost { .. }
                | SyncError::NotConnected
                | SyncError::ZombieConnection { .. }
                | SyncError::WebSocket(_)
        )
    }

    /// Returns `true` for errors that block all further automatic action
    /// until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed { .. }
                | SyncError::InvalidCredential { .. }
                | SyncError::CredentialStore { .. }
                | SyncError::ConfigError { .. }
                | SyncError::ReconnectExhausted { .. }
        )
    }
}

// ─── From impls for external error types ────────────────────────────────

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocket(err.to_string())
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(SyncError::Timeout { seconds: 10 }.is_retryable());
        assert!(SyncError::ConnectionLost { reason: "x".into() }.is_retryable());
        assert!(SyncError::ZombieConnection { silent_secs: 90 }.is_retryable());
        assert!(!SyncError::AuthenticationFailed { reason: "x".into() }.is_retryable());
        assert!(!SyncError::Busy { session_id: "s1".into() }.is_retryable());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(SyncError::NotConnected.is_connection_error());
        assert!(SyncError::ZombieConnection { silent_secs: 1 }.is_connection_error());
        assert!(!SyncError::Timeout { seconds: 1 }.is_connection_error());
        assert!(!SyncError::AuthenticationFailed { reason: "bad".into() }.is_connection_error());
    }

    #[test]
    fn test_fatal_errors_are_never_retryable() {
        let fatal = [
            SyncError::AuthenticationFailed { reason: "x".into() },
            SyncError::CredentialStore {
                path: "/tmp/x".into(),
                reason: "corrupt".into(),
            },
            SyncError::ReconnectExhausted { attempts: 20 },
        ];
        for err in &fatal {
            assert!(err.is_fatal(), "{err} should be fatal");
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }

    #[test]
    fn test_busy_is_not_fatal() {
        let err = SyncError::Busy {
            session_id: "abc".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Session abc is busy");
    }

    #[test]
    fn test_from_tungstenite_error() {
        let ws_error = tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        let err: SyncError = ws_error.into();
        assert!(matches!(err, SyncError::WebSocket(_)));
        assert!(err.to_string().contains("WebSocket error"));
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_from_toml_error_conversion() {
        #[derive(Debug, serde::Deserialize)]
        struct DummyConfig {
            _value: String,
        }

        let toml_err = toml::from_str::<DummyConfig>("value = [").unwrap_err();
        let err: SyncError = toml_err.into();
        assert!(matches!(err, SyncError::ConfigError { .. }));
        assert!(err.to_string().contains("Configuration error"));
    }
}
