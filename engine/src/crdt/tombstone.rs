//! Soft-delete flag that stays mergeable.

use crate::VectorClock;
use serde::{Deserialize, Serialize};

/// Deletion state of an aggregate.
///
/// Every delete merges its clock into `deletes` and every restore into
/// `restores`. The aggregate is deleted iff some delete is not causally
/// covered by a restore, so a delete concurrent with a restore wins, and a
/// replica that never observed a delete cannot undo it by merging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    deletes: VectorClock,
    restores: VectorClock,
}

impl Tombstone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(&mut self, clock: &VectorClock) {
        self.deletes.merge(clock);
    }

    pub fn restore(&mut self, clock: &VectorClock) {
        self.restores.merge(clock);
    }

    pub fn is_deleted(&self) -> bool {
        !self.deletes.is_empty() && !self.deletes.dominated_by(&self.restores)
    }

    pub fn merged(&self, other: &Self) -> Self {
        Self {
            deletes: self.deletes.merged(&other.deletes),
            restores: self.restores.merged(&other.restores),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(d, c)| (d.to_string(), *c)))
    }

    #[test]
    fn fresh_tombstone_is_alive() {
        assert!(!Tombstone::new().is_deleted());
    }

    #[test]
    fn later_restore_undeletes() {
        let mut t = Tombstone::new();
        t.delete(&clock(&[("a", 2)]));
        assert!(t.is_deleted());
        t.restore(&clock(&[("a", 3)]));
        assert!(!t.is_deleted());
    }

    #[test]
    fn restore_then_delete_in_any_order() {
        let delete = clock(&[("a", 2)]);
        let restore = clock(&[("a", 3)]);

        let mut forward = Tombstone::new();
        forward.delete(&delete);
        forward.restore(&restore);

        let mut backward = Tombstone::new();
        backward.restore(&restore);
        backward.delete(&delete);

        assert_eq!(forward, backward);
        assert!(!backward.is_deleted());
    }

    #[test]
    fn concurrent_delete_beats_restore() {
        let mut t = Tombstone::new();
        t.delete(&clock(&[("a", 1), ("b", 2)]));
        t.restore(&clock(&[("a", 2), ("b", 1)]));
        assert!(t.is_deleted());
    }

    #[test]
    fn merge_keeps_unseen_delete() {
        let mut deleted = Tombstone::new();
        deleted.delete(&clock(&[("x", 3)]));
        let untouched = Tombstone::new();

        assert!(deleted.merged(&untouched).is_deleted());
        assert!(untouched.merged(&deleted).is_deleted());
    }
}
