//! Domain events: immutable facts about one aggregate.
//!
//! Every change to the replicated collection is expressed as an event built
//! once at the call site and never mutated. Events are persisted as-is and
//! replayed to rebuild state.

use crate::crdt::Dot;
use crate::error::{Error, Result};
use crate::{AggregateId, DeviceId, EventId, Timestamp, VectorClock, Version};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The three aggregate families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateType {
    Item,
    Location,
    Mapping,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Item => "item",
            AggregateType::Location => "location",
            AggregateType::Mapping => "mapping",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "item" => Ok(AggregateType::Item),
            "location" => Ok(AggregateType::Location),
            "mapping" => Ok(AggregateType::Mapping),
            other => Err(Error::Serialization(format!(
                "unknown aggregate type: {other}"
            ))),
        }
    }
}

/// Physical condition of a book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BookCondition {
    New,
    LikeNew,
    #[default]
    Good,
    Fair,
    Poor,
}

/// What kind of place a storage location is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocationKind {
    Room,
    Bookcase,
    Shelf,
    Box,
    #[default]
    Other,
}

/// Full field set of a new inventory item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemSnapshot {
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
}

impl ItemSnapshot {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Check and normalize the snapshot before it becomes an event.
    pub fn validated(mut self) -> Result<Self> {
        self.title = validate_title(&self.title)?;
        self.isbn = self.isbn.as_deref().map(normalize_isbn).transpose()?;
        if let Some(price) = self.price {
            validate_price(price)?;
        }
        Ok(self)
    }
}

/// Full field set of a new storage location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationSnapshot {
    pub name: String,
    pub description: Option<String>,
    pub kind: LocationKind,
    pub parent_id: Option<AggregateId>,
}

impl LocationSnapshot {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validated(mut self) -> Result<Self> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidField {
                field: "name".into(),
                reason: "must not be empty".into(),
            });
        }
        self.name = name.to_string();
        Ok(self)
    }
}

/// An external identifier (ISBN) pointing at an inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSnapshot {
    pub isbn: String,
    pub item_id: AggregateId,
}

/// Tag edits computed against the issuing replica's view: tags to add and,
/// for each removed tag, the add dots that replica had observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeMap<String, Vec<Dot>>,
}

impl TagDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One updatable inventory item field with its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum ItemField {
    Title(String),
    Authors(Vec<String>),
    Isbn(Option<String>),
    Publisher(Option<String>),
    PublishedYear(Option<i32>),
    PageCount(Option<u32>),
    Genre(Option<String>),
    Condition(BookCondition),
    Price(Option<f64>),
    PurchaseDate(Option<Timestamp>),
    Notes(Option<String>),
    CoverUrl(Option<String>),
    Tags(TagDelta),
}

impl ItemField {
    pub fn validated(self) -> Result<Self> {
        Ok(match self {
            ItemField::Title(title) => ItemField::Title(validate_title(&title)?),
            ItemField::Isbn(isbn) => {
                ItemField::Isbn(isbn.as_deref().map(normalize_isbn).transpose()?)
            }
            ItemField::Price(Some(price)) => {
                validate_price(price)?;
                ItemField::Price(Some(price))
            }
            other => other,
        })
    }
}

impl Field for ItemField {
    const KEYS: &'static [&'static str] = &[
        "title",
        "authors",
        "isbn",
        "publisher",
        "publishedYear",
        "pageCount",
        "genre",
        "condition",
        "price",
        "purchaseDate",
        "notes",
        "coverUrl",
        "tags",
    ];
}

/// One updatable location field with its new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum LocationField {
    Name(String),
    Description(Option<String>),
    Kind(LocationKind),
}

impl LocationField {
    pub fn validated(self) -> Result<Self> {
        Ok(match self {
            LocationField::Name(name) => {
                LocationField::Name(LocationSnapshot::named(name).validated()?.name)
            }
            other => other,
        })
    }
}

impl Field for LocationField {
    const KEYS: &'static [&'static str] = &["name", "description", "kind"];
}

/// A closed set of updatable fields, encoded on the wire as one entry of a
/// JSON object.
pub trait Field: Serialize + DeserializeOwned {
    /// Every key this enum knows. Entries with other keys are skipped when
    /// decoding so newer replicas can add fields.
    const KEYS: &'static [&'static str];
}

/// A sparse map of changed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChanges<F>(Vec<F>);

impl<F> FieldChanges<F> {
    pub fn new(fields: Vec<F>) -> Self {
        Self(fields)
    }

    pub fn iter(&self) -> impl Iterator<Item = &F> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<F> {
        self.0
    }
}

impl<F> From<Vec<F>> for FieldChanges<F> {
    fn from(fields: Vec<F>) -> Self {
        Self(fields)
    }
}

impl<F: Field> Serialize for FieldChanges<F> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::Error as _;

        let mut map = Map::new();
        for field in &self.0 {
            let tagged = serde_json::to_value(field).map_err(S::Error::custom)?;
            let (key, value) = split_tagged(tagged).map_err(S::Error::custom)?;
            map.insert(key, value);
        }
        map.serialize(serializer)
    }
}

impl<'de, F: Field> Deserialize<'de> for FieldChanges<F> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as _;

        let map = Map::deserialize(deserializer)?;
        let mut fields = Vec::with_capacity(map.len());
        for (key, value) in map {
            if !F::KEYS.contains(&key.as_str()) {
                continue;
            }
            let tagged = serde_json::json!({ "field": key, "value": value });
            fields.push(serde_json::from_value(tagged).map_err(D::Error::custom)?);
        }
        Ok(Self(fields))
    }
}

fn split_tagged(tagged: Value) -> std::result::Result<(String, Value), String> {
    let Value::Object(mut object) = tagged else {
        return Err("field did not serialize to an object".into());
    };
    let key = match object.remove("field") {
        Some(Value::String(key)) => key,
        _ => return Err("field is missing its tag".into()),
    };
    let value = object.remove("value").unwrap_or(Value::Null);
    Ok((key, value))
}

/// Events addressed to an inventory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ItemEvent {
    Created(ItemSnapshot),
    Updated(FieldChanges<ItemField>),
    Deleted,
    Restored,
    #[serde(rename_all = "camelCase")]
    LocationChanged { location_id: Option<AggregateId> },
}

/// Events addressed to a storage location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum LocationEvent {
    Created(LocationSnapshot),
    Updated(FieldChanges<LocationField>),
    Deleted,
    #[serde(rename_all = "camelCase")]
    ParentChanged { parent_id: Option<AggregateId> },
}

/// Events addressed to an identifier mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum MappingEvent {
    Created(MappingSnapshot),
    Deleted,
}

/// The aggregate-specific part of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "lowercase")]
pub enum EventPayload {
    Item(ItemEvent),
    Location(LocationEvent),
    Mapping(MappingEvent),
}

impl EventPayload {
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            EventPayload::Item(_) => AggregateType::Item,
            EventPayload::Location(_) => AggregateType::Location,
            EventPayload::Mapping(_) => AggregateType::Mapping,
        }
    }

    /// Stable tag such as `item.created` or `location.parentChanged`.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Item(ItemEvent::Created(_)) => "item.created",
            EventPayload::Item(ItemEvent::Updated(_)) => "item.updated",
            EventPayload::Item(ItemEvent::Deleted) => "item.deleted",
            EventPayload::Item(ItemEvent::Restored) => "item.restored",
            EventPayload::Item(ItemEvent::LocationChanged { .. }) => "item.locationChanged",
            EventPayload::Location(LocationEvent::Created(_)) => "location.created",
            EventPayload::Location(LocationEvent::Updated(_)) => "location.updated",
            EventPayload::Location(LocationEvent::Deleted) => "location.deleted",
            EventPayload::Location(LocationEvent::ParentChanged { .. }) => {
                "location.parentChanged"
            }
            EventPayload::Mapping(MappingEvent::Created(_)) => "mapping.created",
            EventPayload::Mapping(MappingEvent::Deleted) => "mapping.deleted",
        }
    }

    /// The variant's data without its tags, as stored in the payload column.
    pub fn data(&self) -> Result<Value> {
        let inner = match self {
            EventPayload::Item(e) => serde_json::to_value(e)?,
            EventPayload::Location(e) => serde_json::to_value(e)?,
            EventPayload::Mapping(e) => serde_json::to_value(e)?,
        };
        Ok(match inner {
            Value::Object(mut object) => object.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        })
    }

    /// Inverse of [`event_type`](Self::event_type) + [`data`](Self::data).
    pub fn decode(event_type: &str, data: Value) -> Result<Self> {
        let (aggregate, variant) = event_type
            .split_once('.')
            .ok_or_else(|| Error::Serialization(format!("malformed event type: {event_type}")))?;

        let mut tagged = Map::new();
        tagged.insert("type".into(), Value::String(variant.to_string()));
        if !data.is_null() {
            tagged.insert("data".into(), data);
        }
        let tagged = Value::Object(tagged);

        Ok(match aggregate.parse::<AggregateType>()? {
            AggregateType::Item => EventPayload::Item(serde_json::from_value(tagged)?),
            AggregateType::Location => EventPayload::Location(serde_json::from_value(tagged)?),
            AggregateType::Mapping => EventPayload::Mapping(serde_json::from_value(tagged)?),
        })
    }
}

/// An immutable fact about one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    /// Replica that issued the event.
    pub device_id: DeviceId,
    /// Wall clock in milliseconds. Used for sync windows, never causality.
    pub timestamp: Timestamp,
    /// Per-aggregate sequence number assigned by the issuing replica.
    pub version: Version,
    /// Issuer's vector clock right after it bumped its own component.
    pub clock: VectorClock,
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Build an event with a fresh id.
    pub fn new(
        aggregate_id: AggregateId,
        device_id: impl Into<DeviceId>,
        timestamp: Timestamp,
        version: Version,
        clock: VectorClock,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            device_id: device_id.into(),
            timestamp,
            version,
            clock,
            payload,
        }
    }

    pub fn aggregate_type(&self) -> AggregateType {
        self.payload.aggregate_type()
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// This event's own component of its clock.
    pub fn dot(&self) -> Dot {
        Dot::of(&self.clock, &self.device_id)
    }
}

fn validate_title(title: &str) -> Result<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidField {
            field: "title".into(),
            reason: "must not be empty".into(),
        });
    }
    Ok(trimmed.to_string())
}

fn validate_price(price: f64) -> Result<()> {
    if !price.is_finite() || price < 0.0 {
        return Err(Error::InvalidField {
            field: "price".into(),
            reason: format!("{price} is not a valid amount"),
        });
    }
    Ok(())
}

/// Strip separators from an ISBN-10/13 and check its length and alphabet.
pub fn normalize_isbn(raw: &str) -> Result<String> {
    let normalized: String = raw
        .chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let valid = match normalized.len() {
        10 => {
            let (body, check) = normalized.split_at(9);
            body.chars().all(|c| c.is_ascii_digit())
                && check.chars().all(|c| c.is_ascii_digit() || c == 'X')
        }
        13 => normalized.chars().all(|c| c.is_ascii_digit()),
        _ => false,
    };

    if valid {
        Ok(normalized)
    } else {
        Err(Error::InvalidField {
            field: "isbn".into(),
            reason: format!("'{raw}' is not an ISBN-10 or ISBN-13"),
        })
    }
}
