//! Last-writer-wins register stamped with a vector clock.

use crate::{DeviceId, VectorClock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A value plus the vector clock and device of the write that produced it.
///
/// Merge keeps the causally later write. Concurrent writes are ordered by
/// `tie_break`, which every replica evaluates the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwRegister<T> {
    value: T,
    clock: VectorClock,
    device_id: DeviceId,
}

impl<T: Default> Default for LwwRegister<T> {
    /// An unwritten register. Its empty clock loses to any real write.
    fn default() -> Self {
        Self {
            value: T::default(),
            clock: VectorClock::new(),
            device_id: DeviceId::new(),
        }
    }
}

impl<T: Clone> LwwRegister<T> {
    /// First write of `value` by `device_id`.
    pub fn new(value: T, device_id: impl Into<DeviceId>) -> Self {
        let device_id = device_id.into();
        let mut clock = VectorClock::new();
        clock.increment(&device_id);
        Self {
            value,
            clock,
            device_id,
        }
    }

    /// A write carrying an explicit clock, e.g. the clock of the event that
    /// produced it.
    pub fn stamped(value: T, clock: VectorClock, device_id: impl Into<DeviceId>) -> Self {
        Self {
            value,
            clock,
            device_id: device_id.into(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// A new register holding `new_value`, with the clock bumped for
    /// `device_id`. `self` is left untouched.
    pub fn updated(&self, new_value: T, device_id: impl Into<DeviceId>) -> Self {
        let device_id = device_id.into();
        Self {
            value: new_value,
            clock: self.clock.incremented(&device_id),
            device_id,
        }
    }

    /// Apply one write stamped with `clock` on top of this register.
    ///
    /// Used when folding an event: the write replaces the current value
    /// unless the current write is causally later or wins the concurrent
    /// tie-break.
    pub fn written(&self, value: T, clock: &VectorClock, device_id: &str) -> Self {
        let incoming = Self::stamped(value, clock.clone(), device_id);
        if self.outranks(&incoming) {
            self.clone()
        } else {
            incoming
        }
    }

    /// Merge two full register states. Commutative, associative, idempotent.
    pub fn merged(&self, other: &Self) -> Self {
        if other.outranks(self) {
            other.clone()
        } else {
            self.clone()
        }
    }

    /// Total order consistent with happens-before: true iff `self` strictly
    /// beats `other`.
    fn outranks(&self, other: &Self) -> bool {
        match self.clock.compare(&other.clock) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => self.tie_break(other) == Ordering::Greater,
        }
    }

    /// Order of two concurrent writes: the larger clock sum first, then the
    /// smaller device id, then the clocks' device-ordered entries. Ranking by
    /// clock sum ahead of the device id is decision 1 in DESIGN.md.
    fn tie_break(&self, other: &Self) -> Ordering {
        self.clock
            .total()
            .cmp(&other.clock.total())
            // the smaller device id ranks higher
            .then_with(|| other.device_id.cmp(&self.device_id))
            .then_with(|| other.clock.iter().cmp(self.clock.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(d, c)| (d.to_string(), *c)))
    }

    #[test]
    fn updated_bumps_own_component_without_mutating() {
        let r = LwwRegister::new("a".to_string(), "x");
        let r2 = r.updated("b".to_string(), "x");
        assert_eq!(r.value(), "a");
        assert_eq!(r2.value(), "b");
        assert_eq!(r2.clock().timestamp("x"), 2);
        assert!(r.clock().happens_before(r2.clock()));
    }

    #[test]
    fn causally_later_write_wins_regardless_of_device() {
        let early = LwwRegister::stamped(1, clock(&[("a", 1)]), "a");
        let late = LwwRegister::stamped(2, clock(&[("a", 1), ("z", 1)]), "z");
        assert_eq!(early.merged(&late), late);
        assert_eq!(late.merged(&early), late);
    }

    #[test]
    fn concurrent_writes_with_equal_totals_pick_smaller_device() {
        let a = LwwRegister::stamped("from a", clock(&[("a", 1)]), "a");
        let b = LwwRegister::stamped("from b", clock(&[("b", 1)]), "b");
        assert_eq!(*a.merged(&b).value(), "from a");
        assert_eq!(*b.merged(&a).value(), "from a");
    }

    #[test]
    fn concurrent_writes_prefer_larger_total() {
        let a = LwwRegister::stamped("a", clock(&[("a", 1)]), "a");
        let b = LwwRegister::stamped("b", clock(&[("b", 3)]), "b");
        assert_eq!(*a.merged(&b).value(), "b");
    }

    #[test]
    fn written_ignores_stale_write() {
        let current = LwwRegister::stamped(5, clock(&[("a", 3)]), "a");
        let after = current.written(1, &clock(&[("a", 2)]), "a");
        assert_eq!(*after.value(), 5);
    }

    #[test]
    fn default_register_loses_to_any_write() {
        let empty: LwwRegister<String> = LwwRegister::default();
        let w = empty.written("x".into(), &clock(&[("q", 1)]), "q");
        assert_eq!(w.value(), "x");
        assert_eq!(empty.merged(&w), w);
    }

    #[test]
    fn serialization_format() {
        let r = LwwRegister::stamped(7u32, clock(&[("dev", 2)]), "dev");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"value":7,"clock":{"dev":2},"deviceId":"dev"}"#);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_register() -> impl Strategy<Value = LwwRegister<u8>> {
            (
                any::<u8>(),
                proptest::collection::btree_map(
                    prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())],
                    1u64..4,
                    1..3,
                ),
                prop_oneof![Just("a"), Just("b"), Just("c")],
            )
                .prop_map(|(value, counters, device)| {
                    LwwRegister::stamped(value, VectorClock::from(counters), device)
                })
        }

        proptest! {
            #[test]
            fn prop_merge_commutative(a in arb_register(), b in arb_register()) {
                prop_assume!(a.clock() != b.clock() || a.device_id() != b.device_id() || a == b);
                prop_assert_eq!(a.merged(&b), b.merged(&a));
            }

            #[test]
            fn prop_merge_associative(a in arb_register(), b in arb_register(), c in arb_register()) {
                prop_assume!(a.clock() != b.clock() || a.device_id() != b.device_id() || a == b);
                prop_assume!(b.clock() != c.clock() || b.device_id() != c.device_id() || b == c);
                prop_assume!(a.clock() != c.clock() || a.device_id() != c.device_id() || a == c);
                prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
            }

            #[test]
            fn prop_merge_idempotent(a in arb_register()) {
                prop_assert_eq!(a.merged(&a), a);
            }

            #[test]
            fn prop_causal_successor_absorbs(a in arb_register(), b in arb_register()) {
                if a.clock().happens_before(b.clock()) {
                    prop_assert_eq!(a.merged(&b), b);
                }
            }
        }
    }
}
