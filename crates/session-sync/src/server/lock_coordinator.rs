//! # Session Lock Coordinator
//!
//! Authoritative record of which session is locked and by which connection.
//! At most one unit of work runs per session. Acquisition goes through the
//! map's entry API, so check-and-insert is atomic per session and two racing
//! dispatches can never both win.

use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::protocol::SessionId;

#[derive(Debug, Clone)]
pub struct LockOwner {
    pub connection_id: String,
    pub acquired_at: Instant,
}

/// Result of [`LockCoordinator::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Someone else holds the lock.
    Busy { owner: String },
}

#[derive(Default)]
pub struct LockCoordinator {
    locks: DashMap<SessionId, LockOwner>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, session_id: &SessionId, connection_id: &str) -> AcquireOutcome {
        match self.locks.entry(session_id.clone()) {
            Entry::Occupied(held) => AcquireOutcome::Busy {
                owner: held.get().connection_id.clone(),
            },
            Entry::Vacant(slot) => {
                slot.insert(LockOwner {
                    connection_id: connection_id.to_string(),
                    acquired_at: Instant::now(),
                });
                debug!(%session_id, connection_id, "Session locked");
                AcquireOutcome::Acquired
            }
        }
    }

    /// Release a lock held by `connection_id`. Returns `false` if the lock is
    /// gone or now belongs to someone else.
    pub fn release(&self, session_id: &SessionId, connection_id: &str) -> bool {
        self.locks
            .remove_if(session_id, |_, owner| owner.connection_id == connection_id)
            .is_some()
    }

    /// Release regardless of owner. Returns the previous owner.
    pub fn force_release(&self, session_id: &SessionId) -> Option<LockOwner> {
        self.locks.remove(session_id).map(|(_, owner)| owner)
    }

    /// Release every lock held by a connection. Idempotent.
    pub fn release_all_for(&self, connection_id: &str) -> Vec<SessionId> {
        let owned: Vec<SessionId> = self
            .locks
            .iter()
            .filter(|e| e.value().connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();
        let released: Vec<SessionId> = owned
            .into_iter()
            .filter(|id| self.release(id, connection_id))
            .collect();
        if !released.is_empty() {
            info!(connection_id, count = released.len(), "Released locks of departed connection");
        }
        released
    }

    pub fn is_locked(&self, session_id: &SessionId) -> bool {
        self.locks.contains_key(session_id)
    }

    pub fn owner(&self, session_id: &SessionId) -> Option<String> {
        self.locks.get(session_id).map(|o| o.connection_id.clone())
    }

    /// Locked sessions in id order.
    pub fn locked_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.locks.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
