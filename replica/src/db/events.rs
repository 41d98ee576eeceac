//! Append-only event store.

use super::Pool;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use shelf_engine::{
    AggregateId, AggregateType, DomainEvent, EventId, EventPayload, Timestamp, VectorClock,
    Version,
};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const COLUMNS: &str = "seq, event_id, aggregate_id, aggregate_type, event_type, payload, \
                       clock, device_id, timestamp, version";

/// A stored event row from the database.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub seq: i64,
    pub event_id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: String,
    pub clock: String,
    pub device_id: String,
    pub timestamp: i64,
    pub version: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredEvent {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredEvent {
            seq: row.try_get("seq")?,
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            clock: row.try_get("clock")?,
            device_id: row.try_get("device_id")?,
            timestamp: row.try_get("timestamp")?,
            version: row.try_get("version")?,
        })
    }
}

impl StoredEvent {
    /// Flatten a domain event into its row form.
    pub fn from_event(event: &DomainEvent) -> Result<Self> {
        Ok(StoredEvent {
            seq: 0,
            event_id: event.event_id.to_string(),
            aggregate_id: event.aggregate_id.to_string(),
            aggregate_type: event.aggregate_type().to_string(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(&event.payload.data()?)?,
            clock: serde_json::to_string(&event.clock)?,
            device_id: event.device_id.clone(),
            timestamp: event.timestamp as i64,
            version: event.version as i64,
        })
    }

    /// Convert database row back into a domain event.
    pub fn to_event(&self) -> Result<DomainEvent> {
        let payload = EventPayload::decode(&self.event_type, serde_json::from_str(&self.payload)?)?;
        let aggregate_type: AggregateType = self.aggregate_type.parse()?;
        if payload.aggregate_type() != aggregate_type {
            return Err(Error::corrupt(format!(
                "event {} is tagged {} but carries a {} payload",
                self.event_id,
                aggregate_type,
                payload.aggregate_type()
            )));
        }
        let clock: VectorClock = serde_json::from_str(&self.clock)?;

        Ok(DomainEvent {
            event_id: parse_uuid(&self.event_id)?,
            aggregate_id: parse_uuid(&self.aggregate_id)?,
            device_id: self.device_id.clone(),
            timestamp: self.timestamp as Timestamp,
            version: self.version as Version,
            clock,
            payload,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::corrupt(format!("bad uuid {raw:?}: {e}")))
}

pub(crate) fn decode_rows(rows: Vec<StoredEvent>) -> Result<Vec<DomainEvent>> {
    rows.iter().map(StoredEvent::to_event).collect()
}

async fn insert_row<'e, E>(executor: E, row: &StoredEvent) -> std::result::Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO events (
            event_id, aggregate_id, aggregate_type, event_type, payload,
            clock, device_id, timestamp, version, recorded_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(&row.event_id)
    .bind(&row.aggregate_id)
    .bind(&row.aggregate_type)
    .bind(&row.event_type)
    .bind(&row.payload)
    .bind(&row.clock)
    .bind(&row.device_id)
    .bind(row.timestamp)
    .bind(row.version)
    .bind(Utc::now().timestamp_millis())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Durable, append-only log of every event this replica has seen.
///
/// Appends are serialized through one lock so rows from concurrent writers
/// (local edits, cloud pulls, peer sessions) never interleave.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: Pool,
    write_lock: Arc<Mutex<()>>,
}

impl EventStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Append one event. Returns `false` if an event with the same id is
    /// already stored, in which case nothing is written.
    pub async fn save_event(&self, event: &DomainEvent) -> Result<bool> {
        let row = StoredEvent::from_event(event)?;
        let _guard = self.write_lock.lock().await;
        let inserted = insert_row(&self.pool, &row).await?;
        tracing::trace!(event_id = %event.event_id, inserted, "saved event");
        Ok(inserted)
    }

    /// Append a batch atomically: either every new event is stored or none
    /// is. Returns how many were new.
    pub async fn save_events(&self, events: &[DomainEvent]) -> Result<usize> {
        let rows = events
            .iter()
            .map(StoredEvent::from_event)
            .collect::<Result<Vec<_>>>()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in &rows {
            if insert_row(&mut *tx, row).await? {
                inserted += 1;
            }
        }
        tx.commit().await?;

        tracing::debug!(batch = rows.len(), inserted, "saved event batch");
        Ok(inserted)
    }

    pub async fn get_event(&self, event_id: EventId) -> Result<Option<DomainEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM events WHERE event_id = ?");
        let row = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(StoredEvent::to_event).transpose()
    }

    /// Events of one aggregate with `version >= from_version`, by version.
    pub async fn get_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> Result<Vec<DomainEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM events WHERE aggregate_id = ? AND version >= ? \
             ORDER BY version ASC, seq ASC"
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(aggregate_id.to_string())
            .bind(from_version.unwrap_or(0) as i64)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(rows)
    }

    /// Events with a wall-clock timestamp strictly after `since`.
    pub async fn get_events_since(&self, since: Timestamp) -> Result<Vec<DomainEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM events WHERE timestamp > ? ORDER BY timestamp ASC, seq ASC"
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(since as i64)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(rows)
    }

    /// The whole log in append order.
    pub async fn get_all_events(&self) -> Result<Vec<DomainEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM events ORDER BY seq ASC");
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(rows)
    }

    /// Events issued by `device_id` after `since`.
    pub async fn get_events_by_device(
        &self,
        device_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DomainEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM events WHERE device_id = ? AND timestamp > ? \
             ORDER BY timestamp ASC, seq ASC"
        );
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(device_id)
            .bind(since as i64)
            .fetch_all(&self.pool)
            .await?;
        decode_rows(rows)
    }

    /// Page through the log in append order without loading all of it.
    pub fn stream(&self, batch_size: usize) -> EventStream {
        EventStream {
            store: self.clone(),
            after_seq: 0,
            batch_size: batch_size.max(1) as i64,
            done: false,
        }
    }

    /// Highest stored version of `aggregate_id`, 0 if it has no events.
    pub async fn get_current_version(&self, aggregate_id: AggregateId) -> Result<Version> {
        let (version,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?")
                .bind(aggregate_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(version as Version)
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Retention pruning. Irreversible: peers that have not synced past
    /// `cutoff` can no longer receive the removed events.
    pub async fn delete_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        tracing::info!(deleted = result.rows_affected(), %cutoff, "pruned event log");
        Ok(result.rows_affected())
    }
}

/// Cursor over the log in append order.
pub struct EventStream {
    store: EventStore,
    after_seq: i64,
    batch_size: i64,
    done: bool,
}

impl EventStream {
    /// The next page, or `None` once the log is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<DomainEvent>>> {
        if self.done {
            return Ok(None);
        }
        let sql = format!("SELECT {COLUMNS} FROM events WHERE seq > ? ORDER BY seq ASC LIMIT ?");
        let rows = sqlx::query_as::<_, StoredEvent>(&sql)
            .bind(self.after_seq)
            .bind(self.batch_size)
            .fetch_all(&self.store.pool)
            .await?;

        if (rows.len() as i64) < self.batch_size {
            self.done = true;
        }
        match rows.last() {
            Some(last) => self.after_seq = last.seq,
            None => return Ok(None),
        }
        decode_rows(rows).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, run_migrations};
    use shelf_engine::{ItemEvent, ItemField, ItemSnapshot};

    async fn store() -> EventStore {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        EventStore::new(pool)
    }

    fn event(aggregate_id: AggregateId, version: Version, timestamp: Timestamp) -> DomainEvent {
        let payload = if version == 1 {
            EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled("Dune")))
        } else {
            EventPayload::Item(ItemEvent::Updated(
                vec![ItemField::PageCount(Some(412 + version as u32))].into(),
            ))
        };
        DomainEvent::new(
            aggregate_id,
            "device-a",
            timestamp,
            version,
            VectorClock::from_entries([("device-a", version)]),
            payload,
        )
    }

    #[tokio::test]
    async fn roundtrip_and_idempotent_append() {
        let store = store().await;
        let e = event(Uuid::new_v4(), 1, 100);

        assert!(store.save_event(&e).await.unwrap());
        assert!(!store.save_event(&e).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);

        let loaded = store.get_event(e.event_id).await.unwrap().unwrap();
        assert_eq!(loaded, e);
        assert!(store.get_event(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn versions_and_aggregate_queries() {
        let store = store().await;
        let id = Uuid::new_v4();
        assert_eq!(store.get_current_version(id).await.unwrap(), 0);

        store
            .save_events(&[event(id, 1, 10), event(id, 2, 20), event(id, 3, 30)])
            .await
            .unwrap();
        store.save_event(&event(Uuid::new_v4(), 1, 15)).await.unwrap();

        assert_eq!(store.get_current_version(id).await.unwrap(), 3);
        assert_eq!(store.get_events(id, None).await.unwrap().len(), 3);
        let tail = store.get_events(id, Some(2)).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.version).collect::<Vec<_>>(), vec![2, 3]);

        let since = store.get_events_since(15).await.unwrap();
        assert_eq!(since.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![20, 30]);
        assert_eq!(store.get_events_by_device("device-a", 0).await.unwrap().len(), 4);
        assert!(store.get_events_by_device("device-b", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_skips_known_ids() {
        let store = store().await;
        let id = Uuid::new_v4();
        let good = event(id, 1, 10);
        let mut broken = event(id, 2, 20);
        // same id as `good` but different content is ignored, not an error
        broken.event_id = good.event_id;

        assert_eq!(store.save_events(&[good.clone(), broken]).await.unwrap(), 1);
        assert_eq!(store.get_event(good.event_id).await.unwrap().unwrap(), good);
    }

    #[tokio::test]
    async fn stream_pages_through_log() {
        let store = store().await;
        let id = Uuid::new_v4();
        for v in 1..=5 {
            store.save_event(&event(id, v, v * 10)).await.unwrap();
        }

        let mut stream = store.stream(2);
        let mut sizes = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_pruning() {
        let store = store().await;
        let id = Uuid::new_v4();
        store.save_event(&event(id, 1, 1_000)).await.unwrap();
        store.save_event(&event(id, 2, 5_000)).await.unwrap();

        let cutoff = DateTime::<Utc>::from_timestamp_millis(2_000).unwrap();
        assert_eq!(store.delete_events_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
