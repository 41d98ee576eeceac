//! Conflicts between two deliveries of the same event id.
//!
//! An incoming event whose id already exists locally is either a duplicate
//! delivery (identical content, nothing to do) or a genuine conflict. A
//! conflict is classified by comparing the two event clocks and resolved
//! deterministically so every replica keeps the same version.
//!
//! # Resolution order
//!
//! 1. The causally later event wins
//! 2. Otherwise the later wall-clock timestamp wins
//! 3. Then the smaller device id
//! 4. Then the higher version, then the event type tag
//! 5. Fully tied events keep the local copy

use crate::DomainEvent;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How the two sides of a conflict relate causally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// One clock happens-before the other.
    CausallyOrdered,
    /// Neither clock happens-before the other.
    Concurrent,
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local event won
    LocalWins,
    /// Remote event won
    RemoteWins,
}

/// Two different events sharing one event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub local: DomainEvent,
    pub remote: DomainEvent,
    pub kind: ConflictKind,
}

impl Conflict {
    /// Classify `remote` against the stored `local` event with the same id.
    ///
    /// Returns `None` for duplicate delivery of identical content.
    pub fn detect(local: &DomainEvent, remote: &DomainEvent) -> Option<Conflict> {
        if local == remote {
            return None;
        }
        let kind = match local.clock.compare(&remote.clock) {
            Some(Ordering::Less | Ordering::Greater) => ConflictKind::CausallyOrdered,
            _ => ConflictKind::Concurrent,
        };
        Some(Conflict {
            local: local.clone(),
            remote: remote.clone(),
            kind,
        })
    }

    pub fn resolve(&self) -> ConflictResolution {
        let (local, remote) = (&self.local, &self.remote);
        let order = match local.clock.compare(&remote.clock) {
            Some(Ordering::Greater) => Ordering::Greater,
            Some(Ordering::Less) => Ordering::Less,
            _ => local
                .timestamp
                .cmp(&remote.timestamp)
                // the smaller device id ranks higher
                .then_with(|| remote.device_id.cmp(&local.device_id))
                .then_with(|| local.version.cmp(&remote.version))
                .then_with(|| local.event_type().cmp(remote.event_type())),
        };
        match order {
            Ordering::Less => ConflictResolution::RemoteWins,
            Ordering::Equal | Ordering::Greater => ConflictResolution::LocalWins,
        }
    }

    /// The event that survives.
    pub fn winner(&self) -> &DomainEvent {
        match self.resolve() {
            ConflictResolution::LocalWins => &self.local,
            ConflictResolution::RemoteWins => &self.remote,
        }
    }
}
