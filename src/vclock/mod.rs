//! Vector Clock
//!
//! Per-replica LSN tracking for replication progress:
//! - One entry per replica id that has ever produced a row here
//! - LSNs are monotonically non-decreasing per id; a regress is a bug
//! - Merge is reporting-only and never feeds durable state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::replication::{ReplicationError, ReplicationResult};

/// Replica identifier: a small, dense positive integer assigned by the
/// cluster. Zero is reserved for rows that precede id assignment.
pub type ReplicaId = u32;

/// Log sequence number: per-replica monotonically increasing row counter.
pub type Lsn = u64;

/// Mapping from replica id to the highest LSN applied for that id.
///
/// Backed by a `BTreeMap` so iteration is always in ascending id order,
/// which keeps signatures and serialized projections deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, Lsn>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the recorded LSN for `id`, or `None` if never recorded.
    pub fn get(&self, id: ReplicaId) -> Option<Lsn> {
        self.entries.get(&id).copied()
    }

    /// Record that `id` reached `lsn`.
    ///
    /// Monotonicity is a caller-guaranteed invariant: rows from one
    /// connection arrive in order, so a decreasing LSN means the upstream
    /// stream is corrupt and the error must not be swallowed.
    pub fn follow(&mut self, id: ReplicaId, lsn: Lsn) -> ReplicationResult<()> {
        if let Some(prev) = self.entries.get(&id) {
            if lsn < *prev {
                return Err(ReplicationError::logic(format!(
                    "lsn regress for replica {}: {} -> {}",
                    id, prev, lsn
                )));
            }
        }
        self.entries.insert(id, lsn);
        Ok(())
    }

    /// Per-id maximum of two clocks, over the union of their ids.
    ///
    /// Reporting-only: a bidirectional peer tracks one clock on its applier
    /// and one on its relay, and each side may lead on different ids.
    pub fn merge_max(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut merged = a.clone();
        for (&id, &lsn) in &b.entries {
            let slot = merged.entries.entry(id).or_insert(0);
            if lsn > *slot {
                *slot = lsn;
            }
        }
        merged
    }

    /// Sum of all LSNs: a compact signature for equality checks and log
    /// lines. Not an ordering.
    pub fn sum(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Count of ids with a recorded LSN.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether no id has ever been recorded. An empty local clock is what
    /// sends a fresh replica down the bootstrap path.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(id, lsn)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Lsn)> + '_ {
        self.entries.iter().map(|(&id, &lsn)| (id, lsn))
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", id, lsn)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(ReplicaId, Lsn)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, Lsn)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_is_empty() {
        let clock = VectorClock::new();
        assert!(clock.is_empty());
        assert_eq!(clock.size(), 0);
        assert_eq!(clock.sum(), 0);
        assert_eq!(clock.get(1), None);
    }

    #[test]
    fn test_follow_records_last_value() {
        let mut clock = VectorClock::new();
        clock.follow(1, 5).unwrap();
        clock.follow(1, 9).unwrap();
        clock.follow(2, 3).unwrap();

        assert_eq!(clock.get(1), Some(9));
        assert_eq!(clock.get(2), Some(3));
        assert_eq!(clock.size(), 2);
    }

    #[test]
    fn test_follow_allows_equal_lsn() {
        // Non-decreasing, not strictly increasing: a replay of the last
        // confirmed row is legal.
        let mut clock = VectorClock::new();
        clock.follow(1, 5).unwrap();
        assert!(clock.follow(1, 5).is_ok());
    }

    #[test]
    fn test_follow_rejects_regress() {
        let mut clock = VectorClock::new();
        clock.follow(1, 10).unwrap();

        let err = clock.follow(1, 9).unwrap_err();
        assert!(matches!(err, ReplicationError::Logic(_)));
        // State is untouched by the failed call
        assert_eq!(clock.get(1), Some(10));
    }

    #[test]
    fn test_merge_max_takes_per_id_maximum() {
        let a: VectorClock = [(1, 10)].into_iter().collect();
        let b: VectorClock = [(1, 7), (2, 3)].into_iter().collect();

        let merged = VectorClock::merge_max(&a, &b);
        assert_eq!(merged.get(1), Some(10));
        assert_eq!(merged.get(2), Some(3));
        assert_eq!(merged.size(), 2);
    }

    #[test]
    fn test_merge_max_commutative_and_idempotent() {
        let a: VectorClock = [(1, 10), (3, 2)].into_iter().collect();
        let b: VectorClock = [(1, 7), (2, 3)].into_iter().collect();

        assert_eq!(
            VectorClock::merge_max(&a, &b),
            VectorClock::merge_max(&b, &a)
        );
        assert_eq!(VectorClock::merge_max(&a, &a), a);
    }

    #[test]
    fn test_sum_signature() {
        let clock: VectorClock = [(1, 10), (2, 3)].into_iter().collect();
        assert_eq!(clock.sum(), 13);
    }

    #[test]
    fn test_iteration_ascending_and_restartable() {
        let clock: VectorClock = [(7, 1), (2, 5), (4, 9)].into_iter().collect();

        let ids: Vec<ReplicaId> = clock.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 4, 7]);

        // A second pass yields the same finite sequence
        let again: Vec<ReplicaId> = clock.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, again);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let clock: VectorClock = [(1, 10), (2, 3)].into_iter().collect();
        let json = serde_json::to_value(&clock).unwrap();
        assert_eq!(json, serde_json::json!({"1": 10, "2": 3}));
    }

    #[test]
    fn test_display() {
        let clock: VectorClock = [(1, 10), (2, 3)].into_iter().collect();
        assert_eq!(clock.to_string(), "{1: 10, 2: 3}");
    }
}
