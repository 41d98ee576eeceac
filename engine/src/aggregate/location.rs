//! Storage location aggregate.

use super::{merge_register, write, Lifecycle};
use crate::crdt::LwwRegister;
use crate::{
    AggregateId, DeviceId, DomainEvent, LocationEvent, LocationField, LocationKind,
    LocationSnapshot, Timestamp, Version,
};
use serde::{Deserialize, Serialize};

/// Field-level CRDT state of one room, bookcase, shelf or box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtLocation {
    id: AggregateId,
    lifecycle: Lifecycle,
    name: LwwRegister<String>,
    description: LwwRegister<Option<String>>,
    kind: LwwRegister<LocationKind>,
    parent_id: LwwRegister<Option<AggregateId>>,
}

impl CrdtLocation {
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::default(),
            name: LwwRegister::default(),
            description: LwwRegister::default(),
            kind: LwwRegister::default(),
            parent_id: LwwRegister::default(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle.is_deleted()
    }

    pub fn version(&self) -> Version {
        self.lifecycle.version()
    }

    pub fn parent_id(&self) -> Option<AggregateId> {
        *self.parent_id.value()
    }

    pub fn apply(&mut self, event: &DomainEvent, change: &LocationEvent) {
        match change {
            LocationEvent::Created(snapshot) => self.apply_created(event, snapshot),
            LocationEvent::Updated(changes) => {
                for field in changes.iter() {
                    match field {
                        LocationField::Name(v) => write(&mut self.name, v, event),
                        LocationField::Description(v) => write(&mut self.description, v, event),
                        LocationField::Kind(v) => write(&mut self.kind, v, event),
                    }
                }
            }
            LocationEvent::Deleted => self.lifecycle.delete(&event.clock),
            LocationEvent::ParentChanged { parent_id } => {
                write(&mut self.parent_id, parent_id, event)
            }
        }
        self.lifecycle.observe(event);
    }

    fn apply_created(&mut self, event: &DomainEvent, s: &LocationSnapshot) {
        self.lifecycle.created(event);
        write(&mut self.name, &s.name, event);
        write(&mut self.description, &s.description, event);
        write(&mut self.kind, &s.kind, event);
        write(&mut self.parent_id, &s.parent_id, event);
    }

    pub fn merge(&mut self, other: &CrdtLocation) {
        debug_assert_eq!(self.id, other.id);
        self.lifecycle.merge(&other.lifecycle);
        merge_register(&mut self.name, &other.name);
        merge_register(&mut self.description, &other.description);
        merge_register(&mut self.kind, &other.kind);
        merge_register(&mut self.parent_id, &other.parent_id);
    }

    pub fn merged(&self, other: &CrdtLocation) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn materialize(&self) -> Location {
        Location {
            id: self.id,
            name: self.name.value().clone(),
            description: self.description.value().clone(),
            kind: *self.kind.value(),
            parent_id: *self.parent_id.value(),
            created_at: self.lifecycle.created_at(),
            created_by: self.lifecycle.created_by(),
            updated_at: self.lifecycle.updated_at(),
            version: self.lifecycle.version(),
            deleted: self.lifecycle.is_deleted(),
        }
    }
}

/// A storage location as read by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: AggregateId,
    pub name: String,
    pub description: Option<String>,
    pub kind: LocationKind,
    pub parent_id: Option<AggregateId>,
    pub created_at: Timestamp,
    pub created_by: DeviceId,
    pub updated_at: Timestamp,
    pub version: Version,
    pub deleted: bool,
}
