//! Event log ordering against a live PostgreSQL.
//!
//! These tests require a running PostgreSQL database.
//! Set DATABASE_URL before running; without it they return early.

use shelf_engine::{DomainEvent, EventPayload, ItemEvent, ItemSnapshot, VectorClock};
use shelf_server::db;
use shelf_server::handlers::{handle_pull, handle_push, PullQuery, PushRequest};
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

async fn pool() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = db::create_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    Some(pool)
}

fn event(title: &str) -> DomainEvent {
    DomainEvent::new(
        Uuid::new_v4(),
        "device-1",
        1_706_745_600_000,
        1,
        VectorClock::new().incremented("device-1"),
        EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled(title))),
    )
}

fn pull_from(since: u64, limit: i64) -> PullQuery {
    PullQuery {
        since: Some(since),
        limit: Some(limit),
    }
}

#[tokio::test]
async fn later_pushes_wait_for_uncommitted_appends() {
    let Some(pool) = pool().await else { return };
    let identity = format!("alice-{}", Uuid::new_v4());

    // an append that has drawn its seq but not committed yet
    let mut first = db::begin_append(&pool, &identity).await.unwrap();
    let early = event("Dune");
    let early_seq = db::insert_event(&mut first, &identity, &early)
        .await
        .unwrap()
        .unwrap();

    let late = event("Emma");
    let push = tokio::spawn({
        let (pool, identity, late) = (pool.clone(), identity.clone(), late.clone());
        async move {
            handle_push(&pool, &identity, 10, PushRequest { events: vec![late] })
                .await
                .unwrap()
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!push.is_finished(), "second append did not wait");

    let page = handle_pull(&pool, &identity, pull_from(0, 10)).await.unwrap();
    assert!(page.events.is_empty());

    first.commit().await.unwrap();
    let pushed = push.await.unwrap();
    assert!(pushed.response.server_timestamp > early_seq as u64);

    let page = handle_pull(&pool, &identity, pull_from(0, 10)).await.unwrap();
    assert_eq!(page.events, vec![early, late]);
}

#[tokio::test]
async fn a_following_cursor_sees_every_concurrent_push() {
    let Some(pool) = pool().await else { return };
    let identity = format!("alice-{}", Uuid::new_v4());
    let events: Vec<DomainEvent> = (0..40).map(|n| event(&format!("Book {n}"))).collect();

    let pushes: Vec<_> = events
        .iter()
        .cloned()
        .map(|event| {
            let (pool, identity) = (pool.clone(), identity.clone());
            tokio::spawn(async move {
                handle_push(&pool, &identity, 10, PushRequest { events: vec![event] })
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut cursor = 0;
    let mut seen = HashSet::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while seen.len() < events.len() && tokio::time::Instant::now() < deadline {
        let page = handle_pull(&pool, &identity, pull_from(cursor, 3)).await.unwrap();
        seen.extend(page.events.iter().map(|e| e.event_id));
        cursor = page.server_timestamp;
        if !page.has_more {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    for push in pushes {
        push.await.unwrap();
    }

    let expected: HashSet<Uuid> = events.iter().map(|e| e.event_id).collect();
    assert_eq!(seen, expected);
}
