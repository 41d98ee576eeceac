//! Materialized CRDT state per aggregate.
//!
//! Each aggregate keeps one register per field plus a [`Lifecycle`] holding
//! the bookkeeping every family shares. Two entry points change state:
//!
//! - `apply` folds one event into the aggregate
//! - `merge` combines two full copies of the same aggregate
//!
//! Both are order-insensitive: folding the same events in any order, or
//! merging states that each folded a subset, ends in the same value.

pub mod item;
pub mod location;
pub mod mapping;

pub use item::{CrdtItem, InventoryItem};
pub use location::{CrdtLocation, Location};
pub use mapping::{CrdtIsbnMapping, IsbnMapping};

use crate::crdt::{LwwRegister, Tombstone};
use crate::{DeviceId, DomainEvent, Timestamp, VectorClock, Version};
use serde::{Deserialize, Serialize};

/// Who created an aggregate and when.
///
/// Ordered by time then device so that a duplicated Created resolves the
/// same way everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub created_at: Timestamp,
    pub created_by: DeviceId,
}

/// Bookkeeping shared by all aggregate families.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// `None` until a Created event is folded. An aggregate can exist
    /// without it when an update arrives before its creation.
    provenance: Option<Provenance>,
    tombstone: Tombstone,
    /// Merge of every folded event clock.
    clock: VectorClock,
    version: Version,
    updated_at: Timestamp,
}

impl Lifecycle {
    /// Account for one folded event.
    pub fn observe(&mut self, event: &DomainEvent) {
        self.clock.merge(&event.clock);
        self.version = self.version.max(event.version);
        self.updated_at = self.updated_at.max(event.timestamp);
    }

    pub fn created(&mut self, event: &DomainEvent) {
        let origin = Provenance {
            created_at: event.timestamp,
            created_by: event.device_id.clone(),
        };
        self.provenance = Some(match self.provenance.take() {
            Some(existing) => existing.min(origin),
            None => origin,
        });
    }

    pub fn delete(&mut self, clock: &VectorClock) {
        self.tombstone.delete(clock);
    }

    pub fn restore(&mut self, clock: &VectorClock) {
        self.tombstone.restore(clock);
    }

    pub fn merge(&mut self, other: &Lifecycle) {
        self.provenance = match (self.provenance.take(), &other.provenance) {
            (Some(mine), Some(theirs)) => Some(mine.min(theirs.clone())),
            (mine, theirs) => mine.or_else(|| theirs.clone()),
        };
        self.tombstone = self.tombstone.merged(&other.tombstone);
        self.clock.merge(&other.clock);
        self.version = self.version.max(other.version);
        self.updated_at = self.updated_at.max(other.updated_at);
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn is_created(&self) -> bool {
        self.provenance.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.tombstone.is_deleted()
    }

    /// Created and not deleted: what active read accessors return.
    pub fn is_active(&self) -> bool {
        self.is_created() && !self.is_deleted()
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub(crate) fn created_at(&self) -> Timestamp {
        self.provenance.as_ref().map_or(0, |p| p.created_at)
    }

    pub(crate) fn created_by(&self) -> DeviceId {
        self.provenance
            .as_ref()
            .map(|p| p.created_by.clone())
            .unwrap_or_default()
    }
}

/// Fold one field write from `event` into `register`.
pub(crate) fn write<T: Clone>(register: &mut LwwRegister<T>, value: &T, event: &DomainEvent) {
    *register = register.written(value.clone(), &event.clock, &event.device_id);
}

pub(crate) fn merge_register<T: Clone>(register: &mut LwwRegister<T>, other: &LwwRegister<T>) {
    *register = register.merged(other);
}
