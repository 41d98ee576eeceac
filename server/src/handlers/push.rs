//! Push handler - records incoming events from clients.

use crate::db;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use shelf_engine::{Conflict, DomainEvent};
use sqlx::PgPool;
use uuid::Uuid;

/// Request body for push sync.
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub events: Vec<DomainEvent>,
}

/// Response for push sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success_count: usize,
    pub failure_count: usize,
    /// Event ids the server now holds, including ones it already had
    pub accepted: Vec<Uuid>,
    /// Pushed events whose id is stored with other content. `local` is the
    /// pushed copy, `remote` the stored one.
    pub conflicts: Vec<Conflict>,
    /// Current server clock for the identity
    pub server_timestamp: u64,
}

/// A processed push: the response plus the events that were new.
#[derive(Debug)]
pub struct PushOutcome {
    pub response: PushResponse,
    pub recorded: Vec<DomainEvent>,
}

/// Process a push request from a client.
///
/// Pushing an event id twice is a success the second time. Only the first
/// copy is stored. The batch is recorded in one append transaction.
pub async fn handle_push(
    pool: &PgPool,
    identity: &str,
    max_batch: usize,
    request: PushRequest,
) -> Result<PushOutcome> {
    if request.events.len() > max_batch {
        return Err(AppError::QuotaExceeded {
            got: request.events.len(),
            max: max_batch,
        });
    }

    let mut response = PushResponse::default();
    let mut recorded = Vec::new();
    let mut tx = db::begin_append(pool, identity).await?;

    for event in request.events {
        if db::insert_event(&mut tx, identity, &event).await?.is_some() {
            response.accepted.push(event.event_id);
            recorded.push(event);
            continue;
        }

        let stored = db::get_event(&mut tx, identity, event.event_id).await?;
        match stored.and_then(|stored| Conflict::detect(&event, &stored.event)) {
            Some(conflict) => {
                tracing::debug!(
                    event_id = %event.event_id,
                    kind = ?conflict.kind,
                    "pushed copy differs from stored event"
                );
                response.conflicts.push(conflict);
            }
            None => response.accepted.push(event.event_id),
        }
    }

    response.success_count = response.accepted.len();
    response.failure_count = response.conflicts.len();
    response.server_timestamp = db::latest_seq(&mut tx, identity).await?.max(0) as u64;
    tx.commit().await?;

    tracing::info!(
        identity = %identity,
        accepted = response.success_count,
        recorded = recorded.len(),
        conflicts = response.failure_count,
        "push processed"
    );

    Ok(PushOutcome { response, recorded })
}
