//! Observed-remove set.

use crate::{DeviceId, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A unique write stamp: one device's component of a fresh vector clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    pub device: DeviceId,
    pub counter: u64,
}

impl Dot {
    pub fn new(device: impl Into<DeviceId>, counter: u64) -> Self {
        Self {
            device: device.into(),
            counter,
        }
    }

    /// The dot `device` contributed to `clock`.
    pub fn of(clock: &VectorClock, device: &str) -> Self {
        Self::new(device, clock.timestamp(device))
    }
}

/// Add-wins set built from two grow-only sets of `(element, dot)` pairs.
///
/// An element is present iff at least one of its add dots is not in the
/// remove set. Every `add`/`remove` call must use a dot that was never used
/// before, so a re-add after a remove is distinguishable from the add that
/// was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Ord + Serialize",
    deserialize = "T: Ord + Deserialize<'de>"
))]
pub struct ObservedRemoveSet<T: Ord> {
    adds: BTreeSet<(T, Dot)>,
    removes: BTreeSet<(T, Dot)>,
}

impl<T: Ord> Default for ObservedRemoveSet<T> {
    fn default() -> Self {
        Self {
            adds: BTreeSet::new(),
            removes: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> ObservedRemoveSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `element` under a fresh dot.
    pub fn add(&mut self, element: T, dot: Dot) {
        self.adds.insert((element, dot));
    }

    /// Tombstone every currently visible add of `element`, plus `dot` itself.
    ///
    /// Removing an element that was never added changes nothing visible.
    pub fn remove(&mut self, element: &T, dot: Dot) {
        let visible: Vec<Dot> = self.visible_dots(element).cloned().collect();
        for observed in visible {
            self.removes.insert((element.clone(), observed));
        }
        self.removes.insert((element.clone(), dot));
    }

    pub fn contains(&self, element: &T) -> bool {
        self.visible_dots(element).next().is_some()
    }

    /// Present elements in ascending order.
    pub fn elements(&self) -> BTreeSet<T> {
        self.adds
            .iter()
            .filter(|pair| !self.removes.contains(*pair))
            .map(|(element, _)| element.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adds.iter().all(|pair| self.removes.contains(pair))
    }

    /// Union of both grow-only sets.
    pub fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn merge(&mut self, other: &Self) {
        self.adds.extend(other.adds.iter().cloned());
        self.removes.extend(other.removes.iter().cloned());
    }

    /// Add dots of `element` that are currently visible.
    pub fn observed_dots(&self, element: &T) -> Vec<Dot> {
        self.visible_dots(element).cloned().collect()
    }

    /// Tombstone exactly the `observed` add dots of `element`, plus `dot`.
    ///
    /// Unlike [`remove`](Self::remove) this does not look at local state, so
    /// the outcome is the same on every replica regardless of what else it
    /// has already seen.
    pub fn remove_observed<I>(&mut self, element: T, observed: I, dot: Dot)
    where
        I: IntoIterator<Item = Dot>,
    {
        for seen in observed {
            self.removes.insert((element.clone(), seen));
        }
        self.removes.insert((element, dot));
    }

    fn visible_dots<'a>(&'a self, element: &'a T) -> impl Iterator<Item = &'a Dot> + 'a {
        self.adds
            .iter()
            .filter(move |(e, _)| e == element)
            .filter(move |pair| !self.removes.contains(*pair))
            .map(|(_, dot)| dot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_readd() {
        let mut set = ObservedRemoveSet::new();
        set.add("sci-fi", Dot::new("a", 1));
        assert!(set.contains(&"sci-fi"));

        set.remove(&"sci-fi", Dot::new("a", 2));
        assert!(!set.contains(&"sci-fi"));

        set.add("sci-fi", Dot::new("a", 3));
        assert!(set.contains(&"sci-fi"));
    }

    #[test]
    fn removing_unknown_element_is_a_noop_on_membership() {
        let mut set = ObservedRemoveSet::new();
        set.add("a", Dot::new("x", 1));
        set.remove(&"b", Dot::new("x", 2));
        assert!(set.contains(&"a"));
        assert!(!set.contains(&"b"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn concurrent_add_survives_remove() {
        let mut left = ObservedRemoveSet::new();
        left.add("tag", Dot::new("a", 1));
        let mut right = left.clone();

        left.remove(&"tag", Dot::new("a", 2));
        right.add("tag", Dot::new("b", 1));

        let merged = left.merged(&right);
        assert!(merged.contains(&"tag"));
        assert_eq!(merged, right.merged(&left));
    }

    #[test]
    fn remove_observed_leaves_unseen_adds() {
        let mut set = ObservedRemoveSet::new();
        set.add("tag".to_string(), Dot::new("x", 1));
        let observed = set.observed_dots(&"tag".to_string());

        // a concurrent add from y lands before the remove is folded
        set.add("tag".to_string(), Dot::new("y", 1));
        set.remove_observed("tag".to_string(), observed, Dot::new("x", 2));
        assert!(set.contains(&"tag".to_string()));

        set.remove_observed("tag".to_string(), [Dot::new("y", 1)], Dot::new("x", 3));
        assert!(set.is_empty());
    }

    #[test]
    fn dot_of_clock() {
        let clock = VectorClock::from_entries([("a", 3u64), ("b", 1)]);
        assert_eq!(Dot::of(&clock, "a"), Dot::new("a", 3));
    }
}
