//! Conflict-free replicated value containers.
//!
//! All merges here are commutative, associative and idempotent, so replicas
//! converge no matter in which order they exchange state.

mod or_set;
mod register;
mod tombstone;

pub use or_set::{Dot, ObservedRemoveSet};
pub use register::LwwRegister;
pub use tombstone::Tombstone;
