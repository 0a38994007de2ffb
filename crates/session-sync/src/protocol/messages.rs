//! Typed wire messages.
//!
//! Every message is a single JSON object with a mandatory `type` tag and
//! snake_case field names. Server messages that require reliable delivery
//! travel inside an [`Envelope`] carrying a `message_id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credential::Credential;

/// Stable, case-normalized session identifier.
///
/// Identifiers are lowercased whenever one is constructed, which includes
/// every deserialization from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Messages sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present the pre-shared credential. `client_id` identifies the logical
    /// client across sockets so buffered messages can be replayed to it.
    ///
    /// `subscriptions` restores the client's session interest in the same
    /// step, so the state sync that follows already accounts for it.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<Credential>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        subscriptions: Vec<SessionId>,
    },
    Ping,
    Subscribe {
        session_id: SessionId,
    },
    Unsubscribe {
        session_id: SessionId,
    },
    Dispatch {
        session_id: SessionId,
        #[serde(default)]
        payload: Value,
    },
    Unlock {
        session_id: SessionId,
    },
    DeleteSession {
        session_id: SessionId,
    },
    Ack {
        message_id: String,
    },
}

impl ClientMessage {
    /// Wire `type` tag of this message.
    pub fn message_type(&self) -> &'static str {
        use crate::protocol::MessageTypes as T;
        match self {
            Self::Connect { .. } => T::CONNECT,
            Self::Ping => T::PING,
            Self::Subscribe { .. } => T::SUBSCRIBE,
            Self::Unsubscribe { .. } => T::UNSUBSCRIBE,
            Self::Dispatch { .. } => T::DISPATCH,
            Self::Unlock { .. } => T::UNLOCK,
            Self::DeleteSession { .. } => T::DELETE_SESSION,
            Self::Ack { .. } => T::ACK,
        }
    }
}

/// Summary of a session known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    /// Milliseconds since the Unix epoch.
    pub last_activity_at: u64,
    #[serde(default)]
    pub locked: bool,
}

/// Messages sent from the backend to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        protocol_version: u32,
    },
    Connected,
    AuthError {
        message: String,
    },
    Heartbeat {
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
    Pong,
    ActiveStateSync {
        #[serde(default)]
        locked_sessions: Vec<SessionId>,
        #[serde(default)]
        sessions: Vec<SessionSummary>,
    },
    Subscribed {
        session_id: SessionId,
    },
    Unsubscribed {
        session_id: SessionId,
    },
    Accepted {
        session_id: SessionId,
    },
    Busy {
        session_id: SessionId,
    },
    Complete {
        session_id: SessionId,
        #[serde(default)]
        result: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
    SessionLocked {
        session_id: SessionId,
    },
    SessionUnlocked {
        session_id: SessionId,
    },
    SessionDeleted {
        session_id: SessionId,
    },
}

impl ServerMessage {
    /// Whether this message must be buffered until the client acknowledges it.
    ///
    /// Work outcomes are the only messages whose loss would leave the client
    /// showing a session as processing forever.
    pub fn requires_ack(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. }
                | Self::Error {
                    session_id: Some(_),
                    ..
                }
        )
    }

    /// Session this message concerns, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Subscribed { session_id }
            | Self::Unsubscribed { session_id }
            | Self::Accepted { session_id }
            | Self::Busy { session_id }
            | Self::Complete { session_id, .. }
            | Self::SessionLocked { session_id }
            | Self::SessionUnlocked { session_id }
            | Self::SessionDeleted { session_id } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_ref(),
            _ => None,
        }
    }
}

/// A server message plus its delivery-guarantee id.
///
/// `message_id` is present iff the message requires acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Envelope {
    /// Wrap a fire-and-forget message.
    pub fn plain(message: ServerMessage) -> Self {
        Self {
            message_id: None,
            message,
        }
    }

    /// Wrap a delivery-guaranteed message.
    pub fn reliable(message_id: impl Into<String>, message: ServerMessage) -> Self {
        Self {
            message_id: Some(message_id.into()),
            message,
        }
    }
}

impl From<ServerMessage> for Envelope {
    fn from(message: ServerMessage) -> Self {
        Self::plain(message)
    }
}
