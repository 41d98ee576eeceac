//! The whole replicated collection held by one device.

use crate::aggregate::{
    CrdtIsbnMapping, CrdtItem, CrdtLocation, InventoryItem, IsbnMapping, Location,
};
use crate::clock::DotFrontier;
use crate::error::{Error, Result};
use crate::{AggregateId, AggregateType, DomainEvent, EventPayload, VectorClock, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every aggregate this replica knows about, tombstoned ones included.
///
/// `apply` is the fold path for single events, `merge` is the state path
/// for combining with another replica's full state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaState {
    items: BTreeMap<AggregateId, CrdtItem>,
    locations: BTreeMap<AggregateId, CrdtLocation>,
    mappings: BTreeMap<AggregateId, CrdtIsbnMapping>,
    /// Merge of every clock this state has absorbed.
    clock: VectorClock,
    /// Dots of the events folded here. Merging another state does not move
    /// it, since those events were never seen individually.
    frontier: DotFrontier,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event.
    ///
    /// Creates a placeholder aggregate when the first event seen for an id is
    /// not its Created. Fails only if the id already belongs to another
    /// aggregate family.
    pub fn apply(&mut self, event: &DomainEvent) -> Result<()> {
        let id = event.aggregate_id;
        if let Some(actual) = self.aggregate_type(id) {
            let expected = event.aggregate_type();
            if actual != expected {
                return Err(Error::AggregateTypeMismatch {
                    id,
                    expected,
                    actual,
                });
            }
        }

        match &event.payload {
            EventPayload::Item(change) => self
                .items
                .entry(id)
                .or_insert_with(|| CrdtItem::new(id))
                .apply(event, change),
            EventPayload::Location(change) => self
                .locations
                .entry(id)
                .or_insert_with(|| CrdtLocation::new(id))
                .apply(event, change),
            EventPayload::Mapping(change) => self
                .mappings
                .entry(id)
                .or_insert_with(|| CrdtIsbnMapping::new(id))
                .apply(event, change),
        }

        self.clock.merge(&event.clock);
        self.frontier
            .observe(&event.device_id, event.clock.timestamp(&event.device_id));
        Ok(())
    }

    /// Fold events in iteration order, stopping at the first failure.
    pub fn apply_all<'a, I>(&mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a DomainEvent>,
    {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Combine with another replica's full state, aggregate by aggregate.
    pub fn merge(&mut self, other: &ReplicaState) {
        for (id, theirs) in &other.items {
            match self.items.get_mut(id) {
                Some(mine) => mine.merge(theirs),
                None => {
                    self.items.insert(*id, theirs.clone());
                }
            }
        }
        for (id, theirs) in &other.locations {
            match self.locations.get_mut(id) {
                Some(mine) => mine.merge(theirs),
                None => {
                    self.locations.insert(*id, theirs.clone());
                }
            }
        }
        for (id, theirs) in &other.mappings {
            match self.mappings.get_mut(id) {
                Some(mine) => mine.merge(theirs),
                None => {
                    self.mappings.insert(*id, theirs.clone());
                }
            }
        }
        self.clock.merge(&other.clock);
    }

    pub fn merged(&self, other: &ReplicaState) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Which family `id` belongs to, if any event for it was seen.
    pub fn aggregate_type(&self, id: AggregateId) -> Option<AggregateType> {
        if self.items.contains_key(&id) {
            Some(AggregateType::Item)
        } else if self.locations.contains_key(&id) {
            Some(AggregateType::Location)
        } else if self.mappings.contains_key(&id) {
            Some(AggregateType::Mapping)
        } else {
            None
        }
    }

    /// Highest version folded for `id`, 0 if unknown.
    pub fn version_of(&self, id: AggregateId) -> Version {
        if let Some(item) = self.items.get(&id) {
            item.version()
        } else if let Some(location) = self.locations.get(&id) {
            location.version()
        } else if let Some(mapping) = self.mappings.get(&id) {
            mapping.lifecycle().version()
        } else {
            0
        }
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Contiguous per-device prefix of folded events.
    pub fn frontier(&self) -> VectorClock {
        self.frontier.frontier()
    }

    pub fn has_observed(&self, event: &DomainEvent) -> bool {
        self.frontier
            .contains(&event.device_id, event.clock.timestamp(&event.device_id))
    }

    // Raw CRDT state

    pub fn crdt_item(&self, id: AggregateId) -> Option<&CrdtItem> {
        self.items.get(&id)
    }

    pub fn crdt_location(&self, id: AggregateId) -> Option<&CrdtLocation> {
        self.locations.get(&id)
    }

    pub fn crdt_mapping(&self, id: AggregateId) -> Option<&CrdtIsbnMapping> {
        self.mappings.get(&id)
    }

    // Active read accessors: created and not tombstoned

    pub fn item(&self, id: AggregateId) -> Option<InventoryItem> {
        self.items
            .get(&id)
            .filter(|i| i.lifecycle().is_active())
            .map(CrdtItem::materialize)
    }

    pub fn items(&self) -> Vec<InventoryItem> {
        self.items
            .values()
            .filter(|i| i.lifecycle().is_active())
            .map(CrdtItem::materialize)
            .collect()
    }

    /// Active items stored directly at `location_id`.
    pub fn items_at(&self, location_id: AggregateId) -> Vec<InventoryItem> {
        self.items
            .values()
            .filter(|i| i.lifecycle().is_active() && i.location_id() == Some(location_id))
            .map(CrdtItem::materialize)
            .collect()
    }

    /// Tombstoned items, for a trash view.
    pub fn deleted_items(&self) -> Vec<InventoryItem> {
        self.items
            .values()
            .filter(|i| i.lifecycle().is_created() && i.is_deleted())
            .map(CrdtItem::materialize)
            .collect()
    }

    pub fn location(&self, id: AggregateId) -> Option<Location> {
        self.locations
            .get(&id)
            .filter(|l| l.lifecycle().is_active())
            .map(CrdtLocation::materialize)
    }

    pub fn locations(&self) -> Vec<Location> {
        self.locations
            .values()
            .filter(|l| l.lifecycle().is_active())
            .map(CrdtLocation::materialize)
            .collect()
    }

    /// Active locations whose parent is `parent_id` (`None` for roots).
    pub fn child_locations(&self, parent_id: Option<AggregateId>) -> Vec<Location> {
        self.locations
            .values()
            .filter(|l| l.lifecycle().is_active() && l.parent_id() == parent_id)
            .map(CrdtLocation::materialize)
            .collect()
    }

    /// True iff walking up from `start` reaches `ancestor`.
    pub fn is_location_descendant(&self, start: AggregateId, ancestor: AggregateId) -> bool {
        let mut current = Some(start);
        let mut hops = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.locations.len() {
                // concurrent reparenting can close a loop
                return false;
            }
            current = self.locations.get(&id).and_then(CrdtLocation::parent_id);
        }
        false
    }

    pub fn mapping(&self, id: AggregateId) -> Option<IsbnMapping> {
        self.mappings
            .get(&id)
            .filter(|m| m.lifecycle().is_active())
            .map(CrdtIsbnMapping::materialize)
    }

    pub fn mappings(&self) -> Vec<IsbnMapping> {
        self.mappings
            .values()
            .filter(|m| m.lifecycle().is_active())
            .map(CrdtIsbnMapping::materialize)
            .collect()
    }

    /// The active mapping for `isbn`. If concurrent creations left several,
    /// the earliest created one is returned.
    pub fn mapping_for_isbn(&self, isbn: &str) -> Option<IsbnMapping> {
        self.mappings
            .values()
            .filter(|m| m.lifecycle().is_active() && m.isbn() == isbn)
            .min_by(|a, b| {
                a.lifecycle()
                    .provenance()
                    .cmp(&b.lifecycle().provenance())
                    .then_with(|| a.id().cmp(&b.id()))
            })
            .map(CrdtIsbnMapping::materialize)
    }
}
