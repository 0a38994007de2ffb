//! Bounded memory of applied message ids.
//!
//! Replay after a reconnect can deliver a message the client already applied
//! but whose `ack` never reached the backend. Such duplicates are acked again
//! but not re-applied.

use std::collections::{HashSet, VecDeque};

/// Ids remembered before the oldest are forgotten.
pub const APPLIED_HISTORY: usize = 1000;

#[derive(Debug)]
pub struct AppliedMessages {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl Default for AppliedMessages {
    fn default() -> Self {
        Self::with_capacity(APPLIED_HISTORY)
    }
}

impl AppliedMessages {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(APPLIED_HISTORY)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    /// Remember an id. Returns `false` if it was already known.
    pub fn insert(&mut self, message_id: String) -> bool {
        if !self.seen.insert(message_id.clone()) {
            return false;
        }
        self.order.push_back(message_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_detected() {
        let mut applied = AppliedMessages::default();
        assert!(applied.insert("m1".into()));
        assert!(!applied.insert("m1".into()));
        assert!(applied.contains("m1"));
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn test_oldest_ids_are_evicted() {
        let mut applied = AppliedMessages::with_capacity(3);
        for id in ["a", "b", "c", "d"] {
            applied.insert(id.into());
        }
        assert!(!applied.contains("a"));
        assert!(applied.contains("d"));
        assert_eq!(applied.len(), 3);
    }
}
