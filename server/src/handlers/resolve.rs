//! Conflict resolution for pushes that collided with stored events.

use crate::db;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use shelf_engine::{Conflict, ConflictResolution, DomainEvent};
use sqlx::PgPool;

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub conflicts: Vec<Conflict>,
}

/// The surviving copy of every conflicting event, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub events: Vec<DomainEvent>,
}

/// A processed resolution: the winners plus the pushed copies that
/// replaced stored ones.
#[derive(Debug)]
pub struct ResolveOutcome {
    pub response: ResolveResponse,
    pub replaced: Vec<DomainEvent>,
}

/// Settle conflicts against the stored copies. The stored copy is the local
/// side and the pushed copy the remote side. A pushed copy that wins
/// replaces the stored one under a new sequence number.
pub async fn handle_resolve(
    pool: &PgPool,
    identity: &str,
    request: ResolveRequest,
) -> Result<ResolveOutcome> {
    let mut events = Vec::with_capacity(request.conflicts.len());
    let mut replaced = Vec::new();
    let mut tx = db::begin_append(pool, identity).await?;

    for conflict in request.conflicts {
        let pushed = conflict.local;
        let stored = db::get_event(&mut tx, identity, pushed.event_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(format!("no stored event {}", pushed.event_id)))?
            .event;

        let resolution = Conflict::detect(&stored, &pushed).map(|c| c.resolve());
        if resolution == Some(ConflictResolution::RemoteWins) {
            let seq = db::replace_event(&mut tx, identity, &pushed).await?;
            tracing::info!(event_id = %pushed.event_id, seq, "pushed copy replaced stored event");
            replaced.push(pushed.clone());
            events.push(pushed);
        } else {
            events.push(stored);
        }
    }

    tx.commit().await?;

    Ok(ResolveOutcome {
        response: ResolveResponse { events },
        replaced,
    })
}
