//! # Shelf Engine
//!
//! The replicated state core of the Shelf book inventory.
//!
//! Every device keeps its own copy of the collection and records changes as
//! [`DomainEvent`]s. Folding the same set of events on any device, in any
//! cross-device order, yields the same state. This crate holds that pure
//! logic; persistence and transport live in `shelf-replica`.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, network, clocks or logging
//! - **Deterministic**: the same events always produce the same state
//! - **Mergeable**: every piece of state is a CRDT with a commutative,
//!   associative and idempotent merge
//!
//! ## Core Concepts
//!
//! ### Vector clocks
//!
//! [`VectorClock`] gives the partial causal order between events. Every
//! event carries the issuing device's clock right after it bumped its own
//! component; that component is the event's [`Dot`].
//!
//! ### Registers
//!
//! - [`LwwRegister`] - one field value, causally later write wins
//! - [`ObservedRemoveSet`] - add-wins set used for item tags
//! - [`Tombstone`] - soft delete that survives merges
//!
//! ### Aggregates
//!
//! Inventory items, storage locations and ISBN mappings are rebuilt by
//! folding their events ([`ReplicaState::apply`]). Two full replica states
//! combine with [`ReplicaState::merge`]. The two paths are kept separate but
//! land on the same lattice.
//!
//! ## Quick Start
//!
//! ```rust
//! use shelf_engine::{
//!     DomainEvent, EventPayload, ItemEvent, ItemSnapshot, ReplicaState, VectorClock,
//! };
//! use uuid::Uuid;
//!
//! let mut clock = VectorClock::new();
//! clock.increment("device-a");
//!
//! let id = Uuid::new_v4();
//! let created = DomainEvent::new(
//!     id,
//!     "device-a",
//!     1_706_745_600_000,
//!     1,
//!     clock,
//!     EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled("Dune"))),
//! );
//!
//! let mut state = ReplicaState::new();
//! state.apply(&created).unwrap();
//!
//! let item = state.item(id).unwrap();
//! assert_eq!(item.title, "Dune");
//! ```

pub mod aggregate;
pub mod clock;
pub mod conflict;
pub mod crdt;
pub mod error;
pub mod event;
pub mod replica;

// Re-export main types at crate root
pub use aggregate::{
    CrdtIsbnMapping, CrdtItem, CrdtLocation, InventoryItem, IsbnMapping, Lifecycle, Location,
    Provenance,
};
pub use clock::{DotFrontier, VectorClock};
pub use conflict::{Conflict, ConflictKind, ConflictResolution};
pub use crdt::{Dot, LwwRegister, ObservedRemoveSet, Tombstone};
pub use error::{Error, Result};
pub use event::{
    normalize_isbn, AggregateType, BookCondition, DomainEvent, EventPayload, Field, FieldChanges,
    ItemEvent, ItemField, ItemSnapshot, LocationEvent, LocationField, LocationKind,
    LocationSnapshot, MappingEvent, MappingSnapshot, TagDelta,
};
pub use replica::ReplicaState;

/// Type aliases for clarity
pub type DeviceId = String;
pub type AggregateId = uuid::Uuid;
pub type EventId = uuid::Uuid;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
