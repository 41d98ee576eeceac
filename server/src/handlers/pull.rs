//! Pull handler - serves events to clients for sync.

use crate::db;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use shelf_engine::DomainEvent;
use sqlx::PgPool;

/// Query parameters for pull sync.
#[derive(Debug, Default, Deserialize)]
pub struct PullQuery {
    /// Server timestamp from the previous pull (0 for initial sync)
    pub since: Option<u64>,
    /// Maximum number of events to return
    pub limit: Option<i64>,
}

/// Response for pull sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub events: Vec<DomainEvent>,
    pub has_more: bool,
    /// Cursor to pass as `since` for the next page
    pub server_timestamp: u64,
}

/// Response for the latest-timestamp probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestResponse {
    pub server_timestamp: u64,
}

/// Default limit for pull operations.
pub const DEFAULT_LIMIT: i64 = 100;

/// Maximum limit for pull operations.
pub const MAX_LIMIT: i64 = 1000;

/// Process a pull request from a client.
pub async fn handle_pull(pool: &PgPool, identity: &str, query: PullQuery) -> Result<PullResponse> {
    let since = query.since.unwrap_or(0);
    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT);

    // Fetch one more than requested to check if there are more
    let since_seq = i64::try_from(since).unwrap_or(i64::MAX);
    let mut stored = db::get_events_since(pool, identity, since_seq, limit + 1).await?;

    let has_more = stored.len() as i64 > limit;
    stored.truncate(limit as usize);

    let server_timestamp = stored.last().map_or(since, |last| last.seq.max(0) as u64);
    Ok(PullResponse {
        events: stored.into_iter().map(|s| s.event).collect(),
        has_more,
        server_timestamp,
    })
}

pub async fn handle_latest(pool: &PgPool, identity: &str) -> Result<LatestResponse> {
    let mut conn = pool.acquire().await?;
    let seq = db::latest_seq(&mut conn, identity).await?;
    Ok(LatestResponse {
        server_timestamp: seq.max(0) as u64,
    })
}
