//! Client-side view of session locks.
//!
//! Locks are taken optimistically the moment the user dispatches work so the
//! UI can reflect it without a round trip. The backend then either confirms
//! (`accepted`) or rejects (`busy`), and its `active_state_sync` snapshot
//! always wins over whatever the client believed.

use std::collections::BTreeMap;

use crate::protocol::SessionId;

/// Where a local lock stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    /// Taken locally, not yet confirmed by the backend.
    Optimistic,
    /// The backend holds the lock.
    Confirmed,
    /// The backend refused the lock. Not held.
    RolledBack,
}

impl LockPhase {
    pub fn is_held(self) -> bool {
        matches!(self, Self::Optimistic | Self::Confirmed)
    }
}

/// A change to the local lock table, published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTransition {
    pub session_id: SessionId,
    /// `None` when the entry was removed.
    pub phase: Option<LockPhase>,
}

impl LockTransition {
    fn new(session_id: SessionId, phase: Option<LockPhase>) -> Self {
        Self { session_id, phase }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LocalLockTable {
    entries: BTreeMap<SessionId, LockPhase>,
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, session_id: &SessionId) -> Option<LockPhase> {
        self.entries.get(session_id).copied()
    }

    pub fn is_locked(&self, session_id: &SessionId) -> bool {
        self.phase(session_id).is_some_and(LockPhase::is_held)
    }

    /// Sessions currently held, in id order.
    pub fn locked_sessions(&self) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|(_, phase)| phase.is_held())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_held_locks(&self) -> bool {
        self.entries.values().any(|phase| phase.is_held())
    }

    /// Take an optimistic lock. `None` if the session is already held.
    pub fn acquire_optimistic(&mut self, session_id: &SessionId) -> Option<LockTransition> {
        if self.is_locked(session_id) {
            return None;
        }
        self.entries.insert(session_id.clone(), LockPhase::Optimistic);
        Some(LockTransition::new(
            session_id.clone(),
            Some(LockPhase::Optimistic),
        ))
    }

    /// Mark the session locked by the backend, whoever holds it.
    pub fn confirm(&mut self, session_id: &SessionId) -> Option<LockTransition> {
        let previous = self.entries.insert(session_id.clone(), LockPhase::Confirmed);
        (previous != Some(LockPhase::Confirmed))
            .then(|| LockTransition::new(session_id.clone(), Some(LockPhase::Confirmed)))
    }

    /// The backend refused the lock.
    pub fn roll_back(&mut self, session_id: &SessionId) -> Option<LockTransition> {
        match self.entries.get_mut(session_id) {
            Some(phase @ LockPhase::Optimistic) => {
                *phase = LockPhase::RolledBack;
                Some(LockTransition::new(
                    session_id.clone(),
                    Some(LockPhase::RolledBack),
                ))
            }
            _ => None,
        }
    }

    pub fn release(&mut self, session_id: &SessionId) -> Option<LockTransition> {
        self.entries
            .remove(session_id)
            .filter(|phase| phase.is_held())
            .map(|_| LockTransition::new(session_id.clone(), None))
    }

    /// Drop every local lock. Used synchronously on disconnect.
    pub fn clear_all(&mut self) -> Vec<LockTransition> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|(_, phase)| phase.is_held())
            .map(|(id, _)| LockTransition::new(id, None))
            .collect()
    }

    /// Replace local state with the backend's locked set.
    pub fn reconcile(&mut self, server_locked: &[SessionId]) -> Vec<LockTransition> {
        let mut transitions = Vec::new();

        let stale: Vec<SessionId> = self
            .entries
            .keys()
            .filter(|id| !server_locked.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(t) = self.release(&id) {
                transitions.push(t);
            } else {
                self.entries.remove(&id);
            }
        }

        for id in server_locked {
            if let Some(t) = self.confirm(id) {
                transitions.push(t);
            }
        }
        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[test]
    fn test_optimistic_then_confirmed_then_released() {
        let mut table = LocalLockTable::new();
        let t = table.acquire_optimistic(&sid("a")).unwrap();
        assert_eq!(t.phase, Some(LockPhase::Optimistic));
        assert!(table.is_locked(&sid("a")));

        assert!(table.acquire_optimistic(&sid("a")).is_none());

        let t = table.confirm(&sid("a")).unwrap();
        assert_eq!(t.phase, Some(LockPhase::Confirmed));
        assert!(table.confirm(&sid("a")).is_none());

        let t = table.release(&sid("a")).unwrap();
        assert_eq!(t.phase, None);
        assert!(!table.is_locked(&sid("a")));
    }

    #[test]
    fn test_busy_rolls_back_optimistic_lock() {
        let mut table = LocalLockTable::new();
        table.acquire_optimistic(&sid("a"));
        let t = table.roll_back(&sid("a")).unwrap();
        assert_eq!(t.phase, Some(LockPhase::RolledBack));
        assert!(!table.is_locked(&sid("a")));
        assert_eq!(table.phase(&sid("a")), Some(LockPhase::RolledBack));

        // Rolled-back sessions can be dispatched again.
        assert!(table.acquire_optimistic(&sid("a")).is_some());
    }

    #[test]
    fn test_confirmed_lock_is_not_rolled_back() {
        let mut table = LocalLockTable::new();
        table.confirm(&sid("a"));
        assert!(table.roll_back(&sid("a")).is_none());
        assert!(table.is_locked(&sid("a")));
    }

    #[test]
    fn test_clear_all_reports_only_held_locks() {
        let mut table = LocalLockTable::new();
        table.acquire_optimistic(&sid("a"));
        table.confirm(&sid("b"));
        table.acquire_optimistic(&sid("c"));
        table.roll_back(&sid("c"));

        let released: Vec<_> = table
            .clear_all()
            .into_iter()
            .map(|t| t.session_id)
            .collect();
        assert_eq!(released, vec![sid("a"), sid("b")]);
        assert!(!table.has_held_locks());
        assert!(table.phase(&sid("c")).is_none());
    }

    #[test]
    fn test_reconcile_server_wins() {
        let mut table = LocalLockTable::new();
        table.acquire_optimistic(&sid("mine"));
        table.confirm(&sid("stale"));

        let transitions = table.reconcile(&[sid("mine"), sid("remote")]);

        assert_eq!(table.locked_sessions(), vec![sid("mine"), sid("remote")]);
        assert_eq!(table.phase(&sid("mine")), Some(LockPhase::Confirmed));
        assert!(transitions.contains(&LockTransition::new(sid("stale"), None)));
        assert!(transitions.contains(&LockTransition::new(
            sid("remote"),
            Some(LockPhase::Confirmed)
        )));
    }

    #[test]
    fn test_reconcile_with_empty_snapshot_clears_everything() {
        let mut table = LocalLockTable::new();
        table.acquire_optimistic(&sid("a"));
        table.reconcile(&[]);
        assert!(table.locked_sessions().is_empty());
    }
}
