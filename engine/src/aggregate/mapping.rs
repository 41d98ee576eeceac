//! ISBN to item mapping aggregate.

use super::{merge_register, write, Lifecycle};
use crate::crdt::LwwRegister;
use crate::{AggregateId, DomainEvent, MappingEvent, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// CRDT state of one ISBN mapping. The ISBN is the natural key; only the
/// target item is a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtIsbnMapping {
    id: AggregateId,
    lifecycle: Lifecycle,
    isbn: LwwRegister<String>,
    item_id: LwwRegister<AggregateId>,
}

impl CrdtIsbnMapping {
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::default(),
            isbn: LwwRegister::default(),
            item_id: LwwRegister::default(),
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

    pub fn isbn(&self) -> &str {
        self.isbn.value()
    }

    pub fn apply(&mut self, event: &DomainEvent, change: &MappingEvent) {
        match change {
            MappingEvent::Created(snapshot) => {
                self.lifecycle.created(event);
                write(&mut self.isbn, &snapshot.isbn, event);
                write(&mut self.item_id, &snapshot.item_id, event);
            }
            MappingEvent::Deleted => self.lifecycle.delete(&event.clock),
        }
        self.lifecycle.observe(event);
    }

    pub fn merge(&mut self, other: &CrdtIsbnMapping) {
        debug_assert_eq!(self.id, other.id);
        self.lifecycle.merge(&other.lifecycle);
        merge_register(&mut self.isbn, &other.isbn);
        merge_register(&mut self.item_id, &other.item_id);
    }

    pub fn materialize(&self) -> IsbnMapping {
        IsbnMapping {
            id: self.id,
            isbn: self.isbn.value().clone(),
            item_id: *self.item_id.value(),
            created_at: self.lifecycle.created_at(),
            updated_at: self.lifecycle.updated_at(),
            version: self.lifecycle.version(),
            deleted: self.lifecycle.is_deleted(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsbnMapping {
    pub id: AggregateId,
    pub isbn: String,
    pub item_id: AggregateId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub version: Version,
    pub deleted: bool,
}
