//! # Priority Queue Engine
//!
//! Orders queued sessions by `(tier, order)`. Tiers are small integers,
//! lower is more urgent. Within a tier, `order` is a float so a session can
//! be dropped between two neighbours by taking the midpoint, without
//! rewriting every other entry.
//!
//! Repeated midpoint insertion halves the gap each time. Once the smallest
//! gap in a tier falls below [`RENORMALIZE_THRESHOLD`] the tier is rewritten
//! to `1.0, 2.0, 3.0, …` preserving relative order. The same check runs on
//! [`PriorityQueue::from_entries`] so state restored from disk is healed at
//! startup.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::protocol::SessionId;

/// Tier assigned to sessions that have no queue entry.
pub const DEFAULT_TIER: i32 = 0;

/// Smallest tolerated gap between adjacent `order` values in one tier.
pub const RENORMALIZE_THRESHOLD: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub session_id: SessionId,
    pub tier: i32,
    pub order: f64,
}

impl QueueEntry {
    fn sort_key(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then(self.order.total_cmp(&other.order))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("Session {0} is not queued")]
    NotQueued(SessionId),

    #[error("Neighbours {above} and {below} are not in the same tier")]
    TierMismatch { above: SessionId, below: SessionId },

    #[error("Neighbours {above} and {below} are not adjacent")]
    NotAdjacent { above: SessionId, below: SessionId },

    #[error("Reorder needs at least one neighbour")]
    NoNeighbours,
}

/// Result of a successful reorder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub tier: i32,
    /// Final order value, after renormalization if one ran.
    pub order: f64,
    pub renormalized: bool,
}

/// Sessions ordered by `(tier, order)`.
#[derive(Debug, Clone, Default)]
pub struct PriorityQueue {
    entries: Vec<QueueEntry>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted entries.
    ///
    /// Later duplicates of a session id win. Tiers with gaps below the
    /// threshold (or equal order values) are renormalized.
    pub fn from_entries(entries: impl IntoIterator<Item = QueueEntry>) -> Self {
        let mut deduped: Vec<QueueEntry> = Vec::new();
        for entry in entries {
            deduped.retain(|e| e.session_id != entry.session_id);
            deduped.push(entry);
        }
        let mut queue = Self { entries: deduped };
        queue.sort();
        let tiers = queue.tiers();
        for tier in tiers {
            queue.renormalize_if_needed(tier);
        }
        queue
    }

    /// Snapshot in queue order, for persistence.
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.position(session_id).is_some()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| &e.session_id == session_id)
    }

    /// Tier of a session, [`DEFAULT_TIER`] when not queued.
    pub fn tier_of(&self, session_id: &SessionId) -> i32 {
        self.get(session_id).map_or(DEFAULT_TIER, |e| e.tier)
    }

    /// Entries of one tier in order.
    pub fn tier_entries(&self, tier: i32) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter().filter(move |e| e.tier == tier)
    }

    /// Session ids in queue order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.entries.iter().map(|e| e.session_id.clone()).collect()
    }

    /// Append a session to the end of `tier`, moving it if already queued.
    pub fn add_or_move(&mut self, session_id: SessionId, tier: i32) -> &QueueEntry {
        self.entries.retain(|e| e.session_id != session_id);
        let order = self
            .tier_entries(tier)
            .map(|e| e.order)
            .fold(0.0_f64, f64::max)
            + 1.0;
        self.entries.push(QueueEntry {
            session_id: session_id.clone(),
            tier,
            order,
        });
        self.sort();
        let index = self.position(&session_id).unwrap_or(self.entries.len() - 1);
        &self.entries[index]
    }

    /// Remove a session. Its tier reverts to [`DEFAULT_TIER`].
    pub fn remove(&mut self, session_id: &SessionId) -> Option<QueueEntry> {
        let index = self.position(session_id)?;
        Some(self.entries.remove(index))
    }

    /// Keep only sessions for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&SessionId) -> bool) {
        self.entries.retain(|e| keep(&e.session_id));
    }

    /// Place `session_id` between `above` and `below`.
    ///
    /// Either neighbour may be omitted to move to the head or tail of the
    /// other neighbour's tier. The session adopts the neighbours' tier.
    ///
    /// # Errors
    /// [`QueueError`] when a session is not queued, the neighbours straddle
    /// tiers, are given in reverse order, or are not adjacent once the moved
    /// session is taken out.
    pub fn reorder(
        &mut self,
        session_id: &SessionId,
        above: Option<&SessionId>,
        below: Option<&SessionId>,
    ) -> Result<Placement, QueueError> {
        if !self.contains(session_id) {
            return Err(QueueError::NotQueued(session_id.clone()));
        }
        let lookup = |id: &SessionId| {
            self.get(id)
                .map(|e| (e.tier, e.order))
                .ok_or_else(|| QueueError::NotQueued(id.clone()))
        };
        let above_pos = above.map(lookup).transpose()?;
        let below_pos = below.map(lookup).transpose()?;

        let (tier, order) = match (above_pos, below_pos) {
            (None, None) => return Err(QueueError::NoNeighbours),
            (Some((tier, a)), None) => {
                self.ensure_adjacent(session_id, tier, Some(a), None, above, below)?;
                (tier, a + 1.0)
            }
            (None, Some((tier, b))) => {
                self.ensure_adjacent(session_id, tier, None, Some(b), above, below)?;
                (tier, b - 1.0)
            }
            (Some((ta, a)), Some((tb, b))) => {
                if ta != tb {
                    return Err(QueueError::TierMismatch {
                        above: above.cloned().unwrap_or_else(|| session_id.clone()),
                        below: below.cloned().unwrap_or_else(|| session_id.clone()),
                    });
                }
                if a >= b {
                    return Err(QueueError::NotAdjacent {
                        above: above.cloned().unwrap_or_else(|| session_id.clone()),
                        below: below.cloned().unwrap_or_else(|| session_id.clone()),
                    });
                }
                self.ensure_adjacent(session_id, ta, Some(a), Some(b), above, below)?;
                (ta, a + (b - a) / 2.0)
            }
        };

        if let Some(index) = self.position(session_id) {
            let entry = &mut self.entries[index];
            entry.tier = tier;
            entry.order = order;
        }
        self.sort();
        let renormalized = self.renormalize_if_needed(tier);
        let order = self.get(session_id).map_or(order, |e| e.order);
        Ok(Placement {
            tier,
            order,
            renormalized,
        })
    }

    /// Smallest gap between adjacent order values in `tier`.
    pub fn min_gap(&self, tier: i32) -> Option<f64> {
        let orders: Vec<f64> = self.tier_entries(tier).map(|e| e.order).collect();
        orders
            .windows(2)
            .map(|w| w[1] - w[0])
            .min_by(f64::total_cmp)
    }

    pub fn needs_renormalization(&self, tier: i32) -> bool {
        self.min_gap(tier).is_some_and(|gap| gap < RENORMALIZE_THRESHOLD)
    }

    /// Rewrite `tier` to `1.0, 2.0, …` if its gaps have collapsed.
    pub fn renormalize_if_needed(&mut self, tier: i32) -> bool {
        if !self.needs_renormalization(tier) {
            return false;
        }
        self.renormalize(tier);
        true
    }

    /// Rewrite `tier` to consecutive integers, preserving relative order.
    pub fn renormalize(&mut self, tier: i32) {
        let mut count = 0u32;
        for entry in self.entries.iter_mut().filter(|e| e.tier == tier) {
            count += 1;
            entry.order = f64::from(count);
        }
        debug!(tier, entries = count, "Renormalized queue tier");
    }

    fn ensure_adjacent(
        &self,
        moving: &SessionId,
        tier: i32,
        above_order: Option<f64>,
        below_order: Option<f64>,
        above: Option<&SessionId>,
        below: Option<&SessionId>,
    ) -> Result<(), QueueError> {
        let blocked = self.tier_entries(tier).any(|e| {
            &e.session_id != moving
                && Some(&e.session_id) != above
                && Some(&e.session_id) != below
                && above_order.is_none_or(|a| e.order > a)
                && below_order.is_none_or(|b| e.order < b)
        });
        if blocked {
            let fallback = || moving.clone();
            return Err(QueueError::NotAdjacent {
                above: above.cloned().unwrap_or_else(fallback),
                below: below.cloned().unwrap_or_else(fallback),
            });
        }
        Ok(())
    }

    fn position(&self, session_id: &SessionId) -> Option<usize> {
        self.entries.iter().position(|e| &e.session_id == session_id)
    }

    fn sort(&mut self) {
        self.entries.sort_by(QueueEntry::sort_key);
    }

    fn tiers(&self) -> Vec<i32> {
        let mut tiers: Vec<i32> = self.entries.iter().map(|e| e.tier).collect();
        tiers.dedup();
        tiers
    }
}
