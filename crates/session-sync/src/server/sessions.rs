//! Sessions known to the backend.
//!
//! Sessions are discovered from persisted work or created on first dispatch.
//! Deletion is soft: the record stays so late messages about it can be
//! recognised, but it no longer appears in state snapshots.

use dashmap::DashMap;
use tracing::info;

use crate::heartbeat::unix_millis;
use crate::protocol::{SessionId, SessionSummary};
use crate::server::lock_coordinator::LockCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRecord {
    /// Milliseconds since the Unix epoch.
    pub last_activity_at: u64,
    pub deleted: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session found in persisted work. Existing records,
    /// including deleted ones, are left alone.
    pub fn discover(&self, session_id: SessionId, last_activity_at: u64) {
        self.sessions.entry(session_id).or_insert(SessionRecord {
            last_activity_at,
            deleted: false,
        });
    }

    /// Record activity now. Creates the session if unknown.
    pub fn touch(&self, session_id: &SessionId) {
        let now = unix_millis();
        self.sessions
            .entry(session_id.clone())
            .and_modify(|r| r.last_activity_at = r.last_activity_at.max(now))
            .or_insert(SessionRecord {
                last_activity_at: now,
                deleted: false,
            });
    }

    /// Soft-delete. An unknown session gets a deleted tombstone so later
    /// dispatches for it are refused. Returns `false` if it was already
    /// deleted.
    pub fn soft_delete(&self, session_id: &SessionId) -> bool {
        let mut record = self
            .sessions
            .entry(session_id.clone())
            .or_insert(SessionRecord {
                last_activity_at: unix_millis(),
                deleted: false,
            });
        if record.deleted {
            return false;
        }
        record.deleted = true;
        info!(%session_id, "Session soft-deleted");
        true
    }

    pub fn is_deleted(&self, session_id: &SessionId) -> bool {
        self.sessions.get(session_id).is_some_and(|r| r.deleted)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|r| *r)
    }

    /// Live sessions, most recently active first.
    pub fn summaries(&self, locks: &LockCoordinator) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|e| !e.value().deleted)
            .map(|e| SessionSummary {
                session_id: e.key().clone(),
                last_activity_at: e.value().last_activity_at,
                locked: locks.is_locked(e.key()),
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }
}
