//! The per-identity event log.
//!
//! `seq` is the server clock. Sequence values are drawn when a row is
//! written but become visible at commit, so every write for an identity
//! runs inside an [`AppendTx`], which holds a per-identity advisory lock
//! until commit. Readers then never see seq N+1 before seq N.

use shelf_engine::DomainEvent;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// A transaction holding the append lock of one identity.
pub type AppendTx = Transaction<'static, Postgres>;

/// Begin a transaction and wait for the identity's append lock. The lock is
/// released when the transaction commits or rolls back.
pub async fn begin_append(pool: &PgPool, identity: &str) -> Result<AppendTx, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(identity)
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// A stored event with the sequence number it was recorded under.
#[derive(Debug)]
pub struct StoredEvent {
    pub seq: i64,
    pub event: DomainEvent,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let Json(event) = row.try_get::<Json<DomainEvent>, _>("event")?;
        Ok(StoredEvent {
            seq: row.try_get("seq")?,
            event,
        })
    }
}

/// Record an event. Returns `None` when the identity already holds an event
/// with the same id.
pub async fn insert_event(
    conn: &mut PgConnection,
    identity: &str,
    event: &DomainEvent,
) -> Result<Option<i64>, sqlx::Error> {
    let seq: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO events (identity, event_id, aggregate_id, device_id, event_type, event)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (identity, event_id) DO NOTHING
        RETURNING seq
        "#,
    )
    .bind(identity)
    .bind(event.event_id)
    .bind(event.aggregate_id)
    .bind(&event.device_id)
    .bind(event.event_type())
    .bind(Json(event))
    .fetch_optional(conn)
    .await?;

    Ok(seq.map(|(seq,)| seq))
}

/// Swap the stored copy of an event for `event` under a fresh sequence
/// number, so devices that already pulled past the old one see it again.
pub async fn replace_event(
    conn: &mut PgConnection,
    identity: &str,
    event: &DomainEvent,
) -> Result<i64, sqlx::Error> {
    let (seq,): (i64,) = sqlx::query_as(
        r#"
        UPDATE events
        SET seq = nextval(pg_get_serial_sequence('events', 'seq')),
            device_id = $3,
            event_type = $4,
            event = $5,
            received_at = NOW()
        WHERE identity = $1 AND event_id = $2
        RETURNING seq
        "#,
    )
    .bind(identity)
    .bind(event.event_id)
    .bind(&event.device_id)
    .bind(event.event_type())
    .bind(Json(event))
    .fetch_one(conn)
    .await?;

    Ok(seq)
}

pub async fn get_event(
    conn: &mut PgConnection,
    identity: &str,
    event_id: Uuid,
) -> Result<Option<StoredEvent>, sqlx::Error> {
    sqlx::query_as::<_, StoredEvent>(
        r#"
        SELECT seq, event
        FROM events
        WHERE identity = $1 AND event_id = $2
        "#,
    )
    .bind(identity)
    .bind(event_id)
    .fetch_optional(conn)
    .await
}

/// Events recorded after `since`, in sequence order.
pub async fn get_events_since(
    pool: &PgPool,
    identity: &str,
    since: i64,
    limit: i64,
) -> Result<Vec<StoredEvent>, sqlx::Error> {
    sqlx::query_as::<_, StoredEvent>(
        r#"
        SELECT seq, event
        FROM events
        WHERE identity = $1 AND seq > $2
        ORDER BY seq ASC
        LIMIT $3
        "#,
    )
    .bind(identity)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// The latest sequence number recorded for an identity, 0 when empty.
pub async fn latest_seq(conn: &mut PgConnection, identity: &str) -> Result<i64, sqlx::Error> {
    let (seq,): (i64,) =
        sqlx::query_as(r#"SELECT COALESCE(MAX(seq), 0) FROM events WHERE identity = $1"#)
            .bind(identity)
            .fetch_one(conn)
            .await?;

    Ok(seq)
}
