//! # Message Ack Buffer
//!
//! Holds every delivery-guaranteed message until the client acknowledges it.
//! Messages are keyed by logical client, not by socket, so a client that
//! reconnects on a fresh socket receives everything it missed, in original
//! order, before the state snapshot.
//!
//! Each client entry also records where to deliver right now. Enqueue,
//! attach (replay) and detach all happen under that entry's shard lock,
//! which keeps live sends and replays from interleaving out of order.
//!
//! A client that stays detached longer than the retention window is
//! forgotten along with its pending messages. Anonymous clients are keyed by
//! their connection id and are forgotten as soon as that socket goes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{Envelope, ServerMessage};

/// Something that can carry envelopes to a client.
pub trait DeliveryTarget: Send + Sync {
    fn target_id(&self) -> &str;

    /// Queue an envelope. `false` if it could not be queued.
    fn deliver(&self, envelope: &Envelope) -> bool;
}

#[derive(Default)]
struct ClientQueue {
    pending: VecDeque<Envelope>,
    target: Option<Arc<dyn DeliveryTarget>>,
    /// When the queue last lost (or was created without) a live target.
    detached_at: Option<Instant>,
}

impl ClientQueue {
    fn idle_longer_than(&self, max_idle: Duration, now: Instant) -> bool {
        self.target.is_none()
            && self
                .detached_at
                .is_some_and(|since| now.saturating_duration_since(since) >= max_idle)
    }
}

pub struct AckBuffer {
    clients: DashMap<String, ClientQueue>,
    max_per_client: usize,
}

impl AckBuffer {
    pub fn new(max_per_client: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_per_client: max_per_client.max(1),
        }
    }

    /// Make `target` the live delivery path for `client_key` and replay
    /// everything still pending through it, oldest first.
    ///
    /// Returns the number of replayed messages.
    pub fn attach(&self, client_key: &str, target: Arc<dyn DeliveryTarget>) -> usize {
        let mut entry = self.clients.entry(client_key.to_string()).or_default();
        let replayed = entry
            .pending
            .iter()
            .filter(|envelope| target.deliver(envelope))
            .count();
        if replayed > 0 {
            debug!(client_key, replayed, "Replayed unacknowledged messages");
        }
        entry.target = Some(target);
        entry.detached_at = None;
        replayed
    }

    /// Stop live delivery to `target_id`, if it is still the current target.
    pub fn detach(&self, client_key: &str, target_id: &str) {
        let mut remove = false;
        if let Some(mut entry) = self.clients.get_mut(client_key) {
            if entry
                .target
                .as_ref()
                .is_some_and(|t| t.target_id() == target_id)
            {
                entry.target = None;
                entry.detached_at = Some(Instant::now());
            }
            remove = entry.target.is_none() && entry.pending.is_empty();
        }
        if remove {
            self.clients
                .remove_if(client_key, |_, q| q.target.is_none() && q.pending.is_empty());
        }
    }

    /// Drop `client_key`'s queue outright once `target_id` leaves.
    ///
    /// Used for clients keyed by their connection id: nothing can attach
    /// under that key again. A queue that has meanwhile been attached to
    /// another target is kept. Returns the number of discarded messages.
    pub fn forget(&self, client_key: &str, target_id: &str) -> usize {
        let removed = self.clients.remove_if(client_key, |_, q| {
            q.target
                .as_ref()
                .is_none_or(|t| t.target_id() == target_id)
        });
        let discarded = removed.map_or(0, |(_, q)| q.pending.len());
        if discarded > 0 {
            debug!(client_key, discarded, "Discarded unacknowledged messages of departed client");
        }
        discarded
    }

    /// Forget every client that has had no live target for `max_idle`.
    ///
    /// Returns the number of clients removed.
    pub fn prune_idle(&self, max_idle: Duration, now: Instant) -> usize {
        let mut clients = 0usize;
        let mut messages = 0usize;
        self.clients.retain(|client_key, queue| {
            if !queue.idle_longer_than(max_idle, now) {
                return true;
            }
            if !queue.pending.is_empty() {
                warn!(
                    client_key = client_key.as_str(),
                    discarded = queue.pending.len(),
                    "Client exceeded ack retention, dropping its unacknowledged messages"
                );
            }
            clients += 1;
            messages += queue.pending.len();
            false
        });
        if clients > 0 {
            debug!(clients, messages, "Pruned idle ack buffers");
        }
        clients
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Assign a message id, retain the message, and send it if the client
    /// is currently attached.
    pub fn enqueue(&self, client_key: &str, message: ServerMessage) -> Envelope {
        let envelope = Envelope::reliable(Uuid::new_v4().to_string(), message);
        let mut entry = self.clients.entry(client_key.to_string()).or_default();
        if entry.target.is_none() && entry.detached_at.is_none() {
            entry.detached_at = Some(Instant::now());
        }
        entry.pending.push_back(envelope.clone());
        if entry.pending.len() > self.max_per_client {
            if let Some(dropped) = entry.pending.pop_front() {
                warn!(
                    client_key,
                    message_id = dropped.message_id.as_deref().unwrap_or_default(),
                    limit = self.max_per_client,
                    "Ack buffer full, dropping oldest unacknowledged message"
                );
            }
        }
        if let Some(target) = &entry.target {
            if !target.deliver(&envelope) {
                debug!(client_key, "Live delivery failed, message stays buffered");
            }
        }
        envelope
    }

    /// Remove an acknowledged message. Unknown ids are ignored.
    pub fn acknowledge(&self, client_key: &str, message_id: &str) -> bool {
        let Some(mut entry) = self.clients.get_mut(client_key) else {
            return false;
        };
        let before = entry.pending.len();
        entry
            .pending
            .retain(|e| e.message_id.as_deref() != Some(message_id));
        before != entry.pending.len()
    }

    /// Pending envelopes for a client, oldest first.
    pub fn pending(&self, client_key: &str) -> Vec<Envelope> {
        self.clients
            .get(client_key)
            .map(|q| q.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, client_key: &str) -> usize {
        self.clients.get(client_key).map_or(0, |q| q.pending.len())
    }

    pub fn total_pending(&self) -> usize {
        self.clients.iter().map(|q| q.pending.len()).sum()
    }
}
