//! Sync bookkeeping: what was pushed, pulled, resolved and sent to peers.
//!
//! Every write is an upsert keyed by event id, so retried deliveries are
//! harmless.

use super::events::{decode_rows, StoredEvent};
use super::Pool;
use crate::error::Result;
use chrono::Utc;
use shelf_engine::{Conflict, ConflictResolution, DomainEvent, EventId, Timestamp};
use std::collections::HashSet;

const SYNCED: &str = "synced";

#[derive(Debug, Clone)]
pub struct SyncState {
    pool: Pool,
}

impl SyncState {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    // Cloud push status

    /// Oldest events not yet synced for `identity`, in append order.
    pub async fn pending_events(&self, identity: &str, limit: usize) -> Result<Vec<DomainEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT e.seq, e.event_id, e.aggregate_id, e.aggregate_type, e.event_type,
                   e.payload, e.clock, e.device_id, e.timestamp, e.version
            FROM events e
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_status s
                WHERE s.event_id = e.event_id AND s.identity = ? AND s.status = ?
            )
            ORDER BY e.seq ASC
            LIMIT ?
            "#,
        )
        .bind(identity)
        .bind(SYNCED)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(rows)
    }

    pub async fn pending_count(&self, identity: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM events e
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_status s
                WHERE s.event_id = e.event_id AND s.identity = ? AND s.status = ?
            )
            "#,
        )
        .bind(identity)
        .bind(SYNCED)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    pub async fn mark_synced(&self, identity: &str, event_ids: &[EventId]) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for id in event_ids {
            sqlx::query(
                r#"
                INSERT INTO sync_status (event_id, identity, status, synced_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (event_id, identity) DO UPDATE SET
                    status = excluded.status,
                    synced_at = excluded.synced_at
                "#,
            )
            .bind(id.to_string())
            .bind(identity)
            .bind(SYNCED)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn is_synced(&self, identity: &str, event_id: EventId) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM sync_status WHERE event_id = ? AND identity = ? AND status = ?)",
        )
        .bind(event_id.to_string())
        .bind(identity)
        .bind(SYNCED)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Last server timestamp pulled for `identity`, 0 before the first pull.
    pub async fn cursor(&self, identity: &str) -> Result<Timestamp> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_server_timestamp FROM sync_cursor WHERE identity = ?")
                .bind(identity)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map_or(0, |(ts,)| ts as Timestamp))
    }

    /// Move the cursor forward. Never moves it backwards.
    pub async fn advance_cursor(&self, identity: &str, server_timestamp: Timestamp) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursor (identity, last_server_timestamp, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (identity) DO UPDATE SET
                last_server_timestamp = MAX(last_server_timestamp, excluded.last_server_timestamp),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(identity)
        .bind(server_timestamp as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Peer delivery

    pub async fn mark_peer_synced(&self, peer_id: &str, event_ids: &[EventId]) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for id in event_ids {
            sqlx::query(
                r#"
                INSERT INTO peer_sync (event_id, peer_id, synced_at)
                VALUES (?, ?, ?)
                ON CONFLICT (event_id, peer_id) DO NOTHING
                "#,
            )
            .bind(id.to_string())
            .bind(peer_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Ids of events already delivered to `peer_id`.
    pub async fn peer_synced_ids(&self, peer_id: &str) -> Result<HashSet<EventId>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT event_id FROM peer_sync WHERE peer_id = ?")
            .bind(peer_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id,)| id.parse().ok())
            .collect())
    }

    // Conflicts

    pub async fn record_conflict(
        &self,
        conflict: &Conflict,
        resolution: ConflictResolution,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                event_id, local_event, remote_event, kind, resolution, resolved_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (event_id) DO UPDATE SET
                remote_event = excluded.remote_event,
                kind = excluded.kind,
                resolution = excluded.resolution,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(conflict.local.event_id.to_string())
        .bind(serde_json::to_string(&conflict.local)?)
        .bind(serde_json::to_string(&conflict.remote)?)
        .bind(serde_json::to_string(&conflict.kind)?)
        .bind(serde_json::to_string(&resolution)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remote copies that won a conflict, to be folded after the log.
    pub async fn remote_winners(&self) -> Result<Vec<DomainEvent>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT remote_event FROM sync_conflicts WHERE resolution = ? ORDER BY resolved_at ASC",
        )
        .bind(serde_json::to_string(&ConflictResolution::RemoteWins)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(json,)| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    pub async fn conflict_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_conflicts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    // Device settings

    pub async fn device_value(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM device WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_device_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device (key, value) VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
