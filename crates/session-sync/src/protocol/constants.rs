//! Protocol constants for message type tags and protocol versioning.

/// Protocol version announced in the server `hello` greeting.
pub const PROTOCOL_VERSION: u32 = 1;

/// Known wire message type tags.
pub struct MessageTypes;

impl MessageTypes {
    // ─── Connect / Auth ─────────────────────────────────────────────

    /// Client credential presentation. First message on every connection.
    pub const CONNECT: &'static str = "connect";

    /// Server greeting sent immediately after the socket opens.
    pub const HELLO: &'static str = "hello";

    /// Authentication succeeded.
    pub const CONNECTED: &'static str = "connected";

    /// Authentication failed. The socket is closed right after.
    pub const AUTH_ERROR: &'static str = "auth_error";

    // ─── Liveness ───────────────────────────────────────────────────

    /// Periodic server beacon. No reply expected.
    pub const HEARTBEAT: &'static str = "heartbeat";

    /// Client liveness probe. Allowed before authentication.
    pub const PING: &'static str = "ping";

    /// Reply to [`PING`](Self::PING).
    pub const PONG: &'static str = "pong";

    // ─── Sync / Subscriptions ───────────────────────────────────────

    /// Authoritative snapshot of locks and sessions after (re)connect.
    pub const ACTIVE_STATE_SYNC: &'static str = "active_state_sync";

    pub const SUBSCRIBE: &'static str = "subscribe";
    pub const SUBSCRIBED: &'static str = "subscribed";
    pub const UNSUBSCRIBE: &'static str = "unsubscribe";
    pub const UNSUBSCRIBED: &'static str = "unsubscribed";

    // ─── Work dispatch ──────────────────────────────────────────────

    /// Request to run a unit of work on a session.
    pub const DISPATCH: &'static str = "dispatch";

    /// The session lock was acquired and work started.
    pub const ACCEPTED: &'static str = "accepted";

    /// The session is already locked. The client rolls back.
    pub const BUSY: &'static str = "busy";

    /// Work finished successfully. Delivery-guaranteed.
    pub const COMPLETE: &'static str = "complete";

    /// Work failed, or a request was malformed.
    pub const ERROR: &'static str = "error";

    /// Manual unlock override.
    pub const UNLOCK: &'static str = "unlock";

    pub const SESSION_LOCKED: &'static str = "session_locked";
    pub const SESSION_UNLOCKED: &'static str = "session_unlocked";

    /// Soft-delete a session.
    pub const DELETE_SESSION: &'static str = "delete_session";
    pub const SESSION_DELETED: &'static str = "session_deleted";

    // ─── Reliability ────────────────────────────────────────────────

    /// Client acknowledgment of a delivery-guaranteed message.
    pub const ACK: &'static str = "ack";

    /// Every message type a client may send.
    pub const CLIENT_TYPES: [&'static str; 8] = [
        Self::CONNECT,
        Self::PING,
        Self::SUBSCRIBE,
        Self::UNSUBSCRIBE,
        Self::DISPATCH,
        Self::UNLOCK,
        Self::DELETE_SESSION,
        Self::ACK,
    ];

    /// Every message type the backend may send.
    pub const SERVER_TYPES: [&'static str; 15] = [
        Self::HELLO,
        Self::CONNECTED,
        Self::AUTH_ERROR,
        Self::HEARTBEAT,
        Self::PONG,
        Self::ACTIVE_STATE_SYNC,
        Self::SUBSCRIBED,
        Self::UNSUBSCRIBED,
        Self::ACCEPTED,
        Self::BUSY,
        Self::COMPLETE,
        Self::ERROR,
        Self::SESSION_LOCKED,
        Self::SESSION_UNLOCKED,
        Self::SESSION_DELETED,
    ];
}
