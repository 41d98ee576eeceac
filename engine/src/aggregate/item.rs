//! Inventory item aggregate.

use super::{merge_register, write, Lifecycle};
use crate::crdt::{Dot, LwwRegister, ObservedRemoveSet};
use crate::{
    AggregateId, BookCondition, DeviceId, DomainEvent, ItemEvent, ItemField, ItemSnapshot,
    TagDelta, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Field-level CRDT state of one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtItem {
    id: AggregateId,
    lifecycle: Lifecycle,
    title: LwwRegister<String>,
    authors: LwwRegister<Vec<String>>,
    isbn: LwwRegister<Option<String>>,
    publisher: LwwRegister<Option<String>>,
    published_year: LwwRegister<Option<i32>>,
    page_count: LwwRegister<Option<u32>>,
    genre: LwwRegister<Option<String>>,
    condition: LwwRegister<BookCondition>,
    price: LwwRegister<Option<f64>>,
    purchase_date: LwwRegister<Option<Timestamp>>,
    notes: LwwRegister<Option<String>>,
    cover_url: LwwRegister<Option<String>>,
    location_id: LwwRegister<Option<AggregateId>>,
    tags: ObservedRemoveSet<String>,
}

impl CrdtItem {
    /// An empty aggregate that has not seen any event yet.
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::default(),
            title: LwwRegister::default(),
            authors: LwwRegister::default(),
            isbn: LwwRegister::default(),
            publisher: LwwRegister::default(),
            published_year: LwwRegister::default(),
            page_count: LwwRegister::default(),
            genre: LwwRegister::default(),
            condition: LwwRegister::default(),
            price: LwwRegister::default(),
            purchase_date: LwwRegister::default(),
            notes: LwwRegister::default(),
            cover_url: LwwRegister::default(),
            location_id: LwwRegister::default(),
            tags: ObservedRemoveSet::new(),
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

    pub fn title(&self) -> &LwwRegister<String> {
        &self.title
    }

    pub fn notes(&self) -> &LwwRegister<Option<String>> {
        &self.notes
    }

    pub fn price(&self) -> &LwwRegister<Option<f64>> {
        &self.price
    }

    pub fn location_id(&self) -> Option<AggregateId> {
        *self.location_id.value()
    }

    pub fn tags(&self) -> BTreeSet<String> {
        self.tags.elements()
    }

    /// Fold one event addressed to this item.
    pub fn apply(&mut self, event: &DomainEvent, change: &ItemEvent) {
        match change {
            ItemEvent::Created(snapshot) => self.apply_created(event, snapshot),
            ItemEvent::Updated(changes) => {
                for field in changes.iter() {
                    self.apply_field(event, field);
                }
            }
            ItemEvent::Deleted => self.lifecycle.delete(&event.clock),
            ItemEvent::Restored => self.lifecycle.restore(&event.clock),
            ItemEvent::LocationChanged { location_id } => {
                write(&mut self.location_id, location_id, event)
            }
        }
        self.lifecycle.observe(event);
    }

    fn apply_created(&mut self, event: &DomainEvent, s: &ItemSnapshot) {
        self.lifecycle.created(event);
        write(&mut self.title, &s.title, event);
        write(&mut self.authors, &s.authors, event);
        write(&mut self.isbn, &s.isbn, event);
        write(&mut self.publisher, &s.publisher, event);
        write(&mut self.published_year, &s.published_year, event);
        write(&mut self.page_count, &s.page_count, event);
        write(&mut self.genre, &s.genre, event);
        write(&mut self.condition, &s.condition, event);
        write(&mut self.price, &s.price, event);
        write(&mut self.purchase_date, &s.purchase_date, event);
        write(&mut self.notes, &s.notes, event);
        write(&mut self.cover_url, &s.cover_url, event);
        write(&mut self.location_id, &s.location_id, event);
        let dot = event.dot();
        for tag in &s.tags {
            self.tags.add(tag.clone(), dot.clone());
        }
    }

    fn apply_field(&mut self, event: &DomainEvent, field: &ItemField) {
        match field {
            ItemField::Title(v) => write(&mut self.title, v, event),
            ItemField::Authors(v) => write(&mut self.authors, v, event),
            ItemField::Isbn(v) => write(&mut self.isbn, v, event),
            ItemField::Publisher(v) => write(&mut self.publisher, v, event),
            ItemField::PublishedYear(v) => write(&mut self.published_year, v, event),
            ItemField::PageCount(v) => write(&mut self.page_count, v, event),
            ItemField::Genre(v) => write(&mut self.genre, v, event),
            ItemField::Condition(v) => write(&mut self.condition, v, event),
            ItemField::Price(v) => write(&mut self.price, v, event),
            ItemField::PurchaseDate(v) => write(&mut self.purchase_date, v, event),
            ItemField::Notes(v) => write(&mut self.notes, v, event),
            ItemField::CoverUrl(v) => write(&mut self.cover_url, v, event),
            ItemField::Tags(delta) => self.apply_tags(delta, event.dot()),
        }
    }

    fn apply_tags(&mut self, delta: &TagDelta, dot: Dot) {
        for (tag, observed) in &delta.removed {
            self.tags
                .remove_observed(tag.clone(), observed.iter().cloned(), dot.clone());
        }
        for tag in &delta.added {
            self.tags.add(tag.clone(), dot.clone());
        }
    }

    /// The tag edits that turn the current tag set into `target`.
    pub fn tag_delta(&self, target: &BTreeSet<String>) -> TagDelta {
        let current = self.tags.elements();
        TagDelta {
            added: target.difference(&current).cloned().collect(),
            removed: current
                .difference(target)
                .map(|tag| (tag.clone(), self.tags.observed_dots(tag)))
                .collect(),
        }
    }

    /// Combine with another replica's copy of the same item.
    pub fn merge(&mut self, other: &CrdtItem) {
        debug_assert_eq!(self.id, other.id);
        self.lifecycle.merge(&other.lifecycle);
        merge_register(&mut self.title, &other.title);
        merge_register(&mut self.authors, &other.authors);
        merge_register(&mut self.isbn, &other.isbn);
        merge_register(&mut self.publisher, &other.publisher);
        merge_register(&mut self.published_year, &other.published_year);
        merge_register(&mut self.page_count, &other.page_count);
        merge_register(&mut self.genre, &other.genre);
        merge_register(&mut self.condition, &other.condition);
        merge_register(&mut self.price, &other.price);
        merge_register(&mut self.purchase_date, &other.purchase_date);
        merge_register(&mut self.notes, &other.notes);
        merge_register(&mut self.cover_url, &other.cover_url);
        merge_register(&mut self.location_id, &other.location_id);
        self.tags.merge(&other.tags);
    }

    pub fn merged(&self, other: &CrdtItem) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Plain field values for read accessors.
    pub fn materialize(&self) -> InventoryItem {
        InventoryItem {
            id: self.id,
            title: self.title.value().clone(),
            authors: self.authors.value().clone(),
            isbn: self.isbn.value().clone(),
            publisher: self.publisher.value().clone(),
            published_year: *self.published_year.value(),
            page_count: *self.page_count.value(),
            genre: self.genre.value().clone(),
            condition: *self.condition.value(),
            price: *self.price.value(),
            purchase_date: *self.purchase_date.value(),
            notes: self.notes.value().clone(),
            cover_url: self.cover_url.value().clone(),
            location_id: *self.location_id.value(),
            tags: self.tags.elements(),
            created_at: self.lifecycle.created_at(),
            created_by: self.lifecycle.created_by(),
            updated_at: self.lifecycle.updated_at(),
            version: self.lifecycle.version(),
            deleted: self.lifecycle.is_deleted(),
        }
    }
}

/// A book as read by consumers: no registers, no clocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: AggregateId,
    pub title: String,
    pub authors: Vec<String>,
    pub isbn: Option<String>,
    pub publisher: Option<String>,
    pub published_year: Option<i32>,
    pub page_count: Option<u32>,
    pub genre: Option<String>,
    pub condition: BookCondition,
    pub price: Option<f64>,
    pub purchase_date: Option<Timestamp>,
    pub notes: Option<String>,
    pub cover_url: Option<String>,
    pub location_id: Option<AggregateId>,
    pub tags: BTreeSet<String>,
    pub created_at: Timestamp,
    pub created_by: DeviceId,
    pub updated_at: Timestamp,
    pub version: Version,
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventPayload, VectorClock};
    use uuid::Uuid;

    fn event(device: &str, clock: &[(&str, u64)], change: ItemEvent) -> (DomainEvent, ItemEvent) {
        let e = DomainEvent::new(
            Uuid::nil(),
            device,
            1_000,
            1,
            VectorClock::from_entries(clock.iter().map(|(d, c)| (d.to_string(), *c))),
            EventPayload::Item(change.clone()),
        );
        (e, change)
    }

    fn created(title: &str, tags: &[&str]) -> ItemEvent {
        ItemEvent::Created(ItemSnapshot {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..ItemSnapshot::titled(title)
        })
    }

    fn apply(item: &mut CrdtItem, (e, change): &(DomainEvent, ItemEvent)) {
        item.apply(e, change);
    }

    #[test]
    fn created_initializes_every_field() {
        let mut item = CrdtItem::new(Uuid::nil());
        apply(&mut item, &event("x", &[("x", 1)], created("Dune", &["sci-fi"])));

        let read = item.materialize();
        assert_eq!(read.title, "Dune");
        assert_eq!(read.condition, BookCondition::Good);
        assert!(read.tags.contains("sci-fi"));
        assert_eq!(read.created_by, "x");
        assert_eq!(item.title().clock().timestamp("x"), 1);
    }

    #[test]
    fn update_before_create_is_kept() {
        let create = event("x", &[("x", 1)], created("Dune", &[]));
        let rename = event(
            "x",
            &[("x", 2)],
            ItemEvent::Updated(vec![ItemField::Title("Dune Messiah".into())].into()),
        );

        let mut late_create = CrdtItem::new(Uuid::nil());
        apply(&mut late_create, &rename);
        assert!(!late_create.lifecycle().is_created());
        apply(&mut late_create, &create);

        let mut in_order = CrdtItem::new(Uuid::nil());
        apply(&mut in_order, &create);
        apply(&mut in_order, &rename);

        assert_eq!(late_create, in_order);
        assert_eq!(in_order.materialize().title, "Dune Messiah");
    }

    #[test]
    fn tag_delta_removes_only_observed_adds() {
        let mut item = CrdtItem::new(Uuid::nil());
        apply(&mut item, &event("x", &[("x", 1)], created("Dune", &["a", "b"])));

        let target: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let delta = item.tag_delta(&target);
        assert_eq!(delta.added, BTreeSet::from(["c".to_string()]));
        assert_eq!(delta.removed.len(), 1);

        // y re-tags "a" concurrently with x's retag
        let concurrent = event(
            "y",
            &[("x", 1), ("y", 1)],
            ItemEvent::Updated(
                vec![ItemField::Tags(TagDelta {
                    added: BTreeSet::from(["a".to_string()]),
                    ..TagDelta::default()
                })]
                .into(),
            ),
        );
        let retag = event(
            "x",
            &[("x", 2)],
            ItemEvent::Updated(vec![ItemField::Tags(delta)].into()),
        );

        let mut one = item.clone();
        apply(&mut one, &concurrent);
        apply(&mut one, &retag);
        let mut two = item.clone();
        apply(&mut two, &retag);
        apply(&mut two, &concurrent);

        assert_eq!(one, two);
        let tags = one.tags();
        assert!(tags.contains("a"), "concurrent add survives");
        assert!(tags.contains("b"));
        assert!(tags.contains("c"));
    }

    #[test]
    fn location_change_is_a_register_write() {
        let mut item = CrdtItem::new(Uuid::nil());
        apply(&mut item, &event("x", &[("x", 1)], created("Dune", &[])));
        let shelf = Uuid::new_v4();
        apply(
            &mut item,
            &event(
                "x",
                &[("x", 2)],
                ItemEvent::LocationChanged {
                    location_id: Some(shelf),
                },
            ),
        );
        assert_eq!(item.location_id(), Some(shelf));
    }

    #[test]
    fn restore_after_delete() {
        let mut item = CrdtItem::new(Uuid::nil());
        apply(&mut item, &event("x", &[("x", 1)], created("Dune", &[])));
        apply(&mut item, &event("x", &[("x", 2)], ItemEvent::Deleted));
        assert!(item.is_deleted());
        apply(&mut item, &event("x", &[("x", 3)], ItemEvent::Restored));
        assert!(!item.is_deleted());
        assert!(!item.materialize().deleted);
    }
}
