//! Vector clock for causal ordering of events across replicas.
//!
//! Each replica owns one component of the clock and only ever bumps its own
//! counter. Comparing two clocks yields a partial order: one clock either
//! happens-before the other, they are equal, or they are concurrent.

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Per-device logical time.
///
/// Components that were never incremented read as 0 and are not stored, so
/// `{a: 0}` and `{}` are the same clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<DeviceId, u64>", into = "BTreeMap<DeviceId, u64>")]
pub struct VectorClock {
    counters: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Create an empty clock (every component is 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from explicit components. Zero components are dropped.
    pub fn from_entries<I, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (D, u64)>,
        D: Into<DeviceId>,
    {
        entries
            .into_iter()
            .map(|(device, counter)| (device.into(), counter))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    /// Bump the component owned by `device` and return the new value.
    pub fn increment(&mut self, device: &str) -> u64 {
        let counter = self.counters.entry(device.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Return a copy of this clock with `device`'s component bumped.
    pub fn incremented(&self, device: &str) -> Self {
        let mut next = self.clone();
        next.increment(device);
        next
    }

    /// Read one component, 0 for devices never seen.
    pub fn timestamp(&self, device: &str) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    /// Pointwise maximum over the union of devices.
    pub fn merged(&self, other: &VectorClock) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// In-place pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.counters {
            let entry = self.counters.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// True iff every component of `self` is <= the matching component of
    /// `other` and at least one is strictly less.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// True iff neither clock happens-before the other and they differ.
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other).is_none()
    }

    /// True iff `self` happens-before or equals `other`.
    pub fn dominated_by(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Some(Ordering::Less | Ordering::Equal))
    }

    /// Causal comparison. `None` means the clocks are concurrent.
    pub fn compare(&self, other: &VectorClock) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;

        for (device, &counter) in &self.counters {
            match counter.cmp(&other.timestamp(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        for (device, &counter) in &other.counters {
            if !self.counters.contains_key(device) && counter > 0 {
                less = true;
            }
        }

        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }

    /// Sum of all components. Strictly increases along happens-before, so it
    /// is usable as a secondary logical counter for concurrent clocks.
    pub fn total(&self) -> u64 {
        self.counters
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    /// Iterate over the non-zero components in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.counters.iter().map(|(d, c)| (d, *c))
    }

    /// Devices with a non-zero component.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.counters.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl From<BTreeMap<DeviceId, u64>> for VectorClock {
    fn from(mut counters: BTreeMap<DeviceId, u64>) -> Self {
        counters.retain(|_, c| *c > 0);
        Self { counters }
    }
}

impl From<VectorClock> for BTreeMap<DeviceId, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.counters
    }
}

/// Tracks which per-device dots have been observed and exposes the
/// contiguous frontier.
///
/// A device's events carry dots 1, 2, 3, ... in its own clock component.
/// Events can arrive out of order, so the frontier only advances past a dot
/// once every smaller dot from that device has been seen too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotFrontier {
    contiguous: BTreeMap<DeviceId, u64>,
    detached: BTreeMap<DeviceId, std::collections::BTreeSet<u64>>,
}

impl DotFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `device`'s event with dot `dot` was observed.
    pub fn observe(&mut self, device: &str, dot: u64) {
        if dot == 0 {
            return;
        }
        let head = self.contiguous.entry(device.to_string()).or_insert(0);
        if dot <= *head {
            return;
        }
        if dot != *head + 1 {
            self.detached
                .entry(device.to_string())
                .or_default()
                .insert(dot);
            return;
        }
        *head = dot;
        if let Some(pending) = self.detached.get_mut(device) {
            while pending.remove(&(*head + 1)) {
                *head += 1;
            }
            pending.retain(|d| *d > *head);
            if pending.is_empty() {
                self.detached.remove(device);
            }
        }
    }

    /// True iff `dot` from `device` was observed.
    pub fn contains(&self, device: &str, dot: u64) -> bool {
        dot <= self.contiguous.get(device).copied().unwrap_or(0)
            || self
                .detached
                .get(device)
                .is_some_and(|pending| pending.contains(&dot))
    }

    /// The contiguous prefix per device, as a clock.
    pub fn frontier(&self) -> VectorClock {
        self.contiguous.clone().into()
    }

    /// Devices with observed dots above a gap.
    pub fn has_gaps(&self) -> bool {
        !self.detached.is_empty()
    }
}
