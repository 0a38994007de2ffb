//! Backend-side state of one client socket.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::protocol::codec;
use crate::protocol::{Envelope, ServerMessage, SessionId};
use crate::server::ack_buffer::DeliveryTarget;

/// Frames queued for the socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(String),
    Close,
}

/// A connected client socket.
///
/// Cheap to share: the writer half of the socket lives in a dedicated task
/// fed through a bounded channel, so `send` never awaits.
pub struct ServerConnection {
    id: String,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    /// Logical client identity, set exactly once on successful `connect`.
    client_key: OnceLock<String>,
    /// Set when `client_key` is this connection's own id.
    anonymous: AtomicBool,
    subscriptions: DashSet<SessionId>,
    connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl ServerConnection {
    pub(crate) fn new(id: String, tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            id,
            tx,
            cancel,
            client_key: OnceLock::new(),
            anonymous: AtomicBool::new(false),
            subscriptions: DashSet::new(),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.client_key.get().is_some()
    }

    /// Identity used for acknowledgment tracking, once authenticated.
    pub fn client_key(&self) -> Option<&str> {
        self.client_key.get().map(String::as_str)
    }

    /// Whether the client key is the connection id, i.e. no other socket
    /// can ever claim this client's buffered messages.
    pub fn is_anonymous(&self) -> bool {
        self.anonymous.load(Ordering::Acquire)
    }

    /// Record successful authentication. Returns `false` if already set.
    pub(crate) fn authenticate(&self, client_key: String, anonymous: bool) -> bool {
        let first = self.client_key.set(client_key).is_ok();
        if first {
            self.anonymous.store(anonymous, Ordering::Release);
        }
        first
    }

    /// Queue an envelope for the socket.
    ///
    /// Returns `false` if the channel is full or closed.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match codec::encode_server(envelope) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to encode outbound message");
                false
            }
        }
    }

    pub fn send_message(&self, message: ServerMessage) -> bool {
        self.send(&Envelope::plain(message))
    }

    pub(crate) fn send_text(&self, text: String) -> bool {
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = %self.id, "Outbound channel full, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the writer to send a close frame after pending frames.
    pub(crate) fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    /// Tear the connection down without waiting for the writer.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn subscribe(&self, session_id: SessionId) {
        self.subscriptions.insert(session_id);
    }

    pub fn unsubscribe(&self, session_id: &SessionId) {
        self.subscriptions.remove(session_id);
    }

    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.subscriptions.contains(session_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl DeliveryTarget for ServerConnection {
    fn target_id(&self) -> &str {
        &self.id
    }

    fn deliver(&self, envelope: &Envelope) -> bool {
        self.send(envelope)
    }
}
