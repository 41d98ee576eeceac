//! Repository behaviour over a real (in-memory) SQLite store.

use shelf_engine::{BookCondition, ItemField, ItemSnapshot, LocationSnapshot};
use shelf_replica::db::{create_memory_pool, run_migrations, EventStore, Pool, SyncState};
use shelf_replica::{Error, ReplicaRepository};
use std::collections::BTreeSet;
use std::sync::Arc;

async fn pool() -> Pool {
    let pool = create_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

async fn open(pool: &Pool, device: &str) -> ReplicaRepository {
    ReplicaRepository::open(
        EventStore::new(pool.clone()),
        SyncState::new(pool.clone()),
        device.to_string(),
    )
    .await
    .unwrap()
}

/// Hand every event of `from` to `to`.
async fn deliver(from: &ReplicaRepository, to: &ReplicaRepository) {
    let events = from.store().get_all_events().await.unwrap();
    to.sync_events(&events).await.unwrap();
}

#[tokio::test]
async fn restart_replays_the_log() {
    let pool = pool().await;
    let repo = open(&pool, "device-a").await;
    let shelf = repo
        .create_location(LocationSnapshot::named("Hallway shelf"))
        .await
        .unwrap();
    let item = repo
        .create_item(ItemSnapshot {
            location_id: Some(shelf),
            condition: BookCondition::LikeNew,
            ..ItemSnapshot::titled("Dune")
        })
        .await
        .unwrap();
    repo.update_item(item, vec![ItemField::Price(Some(12.5))])
        .await
        .unwrap();
    let before = repo.snapshot().await;
    drop(repo);

    let reopened = open(&pool, "device-a").await;
    assert_eq!(reopened.snapshot().await, before);
    assert_eq!(reopened.items_at(shelf).await.len(), 1);

    // the clock continues where it left off
    reopened.delete_item(item).await.unwrap();
    let events = reopened.store().get_events(item, None).await.unwrap();
    assert_eq!(events.last().unwrap().clock.timestamp("device-a"), 4);
    assert_eq!(events.last().unwrap().version, 3);
}

#[tokio::test]
async fn delete_and_restore() {
    let pool = pool().await;
    let repo = open(&pool, "device-a").await;
    let id = repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();

    repo.delete_item(id).await.unwrap();
    assert!(repo.item(id).await.is_none());
    assert_eq!(repo.deleted_items().await.len(), 1);
    assert!(matches!(
        repo.update_item(id, vec![ItemField::Notes(None)]).await,
        Err(Error::AggregateNotFound(_))
    ));
    assert!(matches!(repo.delete_item(id).await, Err(Error::AggregateNotFound(_))));

    repo.restore_item(id).await.unwrap();
    assert_eq!(repo.item(id).await.unwrap().title, "Dune");
    assert!(matches!(repo.restore_item(id).await, Err(Error::AggregateNotFound(_))));
}

#[tokio::test]
async fn invalid_input_is_rejected_before_emitting() {
    let pool = pool().await;
    let repo = open(&pool, "device-a").await;

    assert!(matches!(
        repo.create_item(ItemSnapshot::titled("   ")).await,
        Err(Error::Engine(shelf_engine::Error::InvalidField { .. }))
    ));
    assert!(matches!(
        repo.create_item(ItemSnapshot {
            location_id: Some(uuid::Uuid::new_v4()),
            ..ItemSnapshot::titled("Dune")
        })
        .await,
        Err(Error::AggregateNotFound(_))
    ));
    assert_eq!(repo.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn isbn_mappings_are_unique() {
    let pool = pool().await;
    let repo = open(&pool, "device-a").await;
    let item = repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();

    let mapping = repo.create_mapping("978-0-441-17271-9", item).await.unwrap();
    assert!(matches!(
        repo.create_mapping("9780441172719", item).await,
        Err(Error::AggregateAlreadyExists(isbn)) if isbn == "9780441172719"
    ));
    assert_eq!(
        repo.mapping_for_isbn("978 0 441 17271 9").await.unwrap().item_id,
        item
    );

    repo.delete_mapping(mapping).await.unwrap();
    assert!(repo.mapping_for_isbn("9780441172719").await.is_none());
    repo.create_mapping("9780441172719", item).await.unwrap();
}

#[tokio::test]
async fn replicas_converge_after_exchange() {
    let (pa, pb) = (pool().await, pool().await);
    let a = open(&pa, "device-a").await;
    let b = open(&pb, "device-b").await;

    let item = a.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
    let shelf = b.create_location(LocationSnapshot::named("Shelf")).await.unwrap();
    deliver(&a, &b).await;
    deliver(&b, &a).await;

    // concurrent edits to different fields both survive
    a.update_item(item, vec![ItemField::Title("Dune (50th Anniversary)".into())])
        .await
        .unwrap();
    b.update_item(item, vec![ItemField::Notes(Some("first edition".into()))])
        .await
        .unwrap();
    b.move_item(item, Some(shelf)).await.unwrap();
    deliver(&a, &b).await;
    deliver(&b, &a).await;

    let (ia, ib) = (a.item(item).await.unwrap(), b.item(item).await.unwrap());
    assert_eq!(ia, ib);
    assert_eq!(ia.title, "Dune (50th Anniversary)");
    assert_eq!(ia.notes.as_deref(), Some("first edition"));
    assert_eq!(ia.location_id, Some(shelf));
    assert_eq!(a.locations().await, b.locations().await);
    assert_eq!(a.frontier().await, b.frontier().await);
}

#[tokio::test]
async fn concurrent_tag_edits_keep_unseen_adds() {
    let (pa, pb) = (pool().await, pool().await);
    let a = open(&pa, "device-a").await;
    let b = open(&pb, "device-b").await;
    let item = a.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
    a.set_item_tags(item, BTreeSet::from(["scifi".to_string()]))
        .await
        .unwrap();
    deliver(&a, &b).await;

    a.set_item_tags(item, BTreeSet::new()).await.unwrap();
    b.set_item_tags(item, BTreeSet::from(["scifi".to_string(), "desert".to_string()]))
        .await
        .unwrap();
    deliver(&a, &b).await;
    deliver(&b, &a).await;

    let expected = BTreeSet::from(["desert".to_string()]);
    assert_eq!(a.item(item).await.unwrap().tags, expected);
    assert_eq!(b.item(item).await.unwrap().tags, expected);
}

#[tokio::test]
async fn redelivery_is_a_duplicate() {
    let (pa, pb) = (pool().await, pool().await);
    let a = open(&pa, "device-a").await;
    let b = open(&pb, "device-b").await;
    a.create_item(ItemSnapshot::titled("Dune")).await.unwrap();

    let events = a.store().get_all_events().await.unwrap();
    let first = b.sync_events(&events).await.unwrap();
    let second = b.sync_events(&events).await.unwrap();
    assert_eq!(first.applied, 1);
    assert_eq!(second.applied, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(b.store().count().await.unwrap(), 1);
}

#[tokio::test]
async fn changes_are_broadcast() {
    let pool = pool().await;
    let repo = open(&pool, "device-a").await;
    let mut changes = repo.subscribe();

    let id = repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
    let event = changes.recv().await.unwrap();
    assert_eq!(event.aggregate_id, id);
    assert_eq!(event.event_type(), "item.created");
}

#[tokio::test]
async fn concurrent_writers_are_serialized() {
    let pool = pool().await;
    let repo = Arc::new(open(&pool, "device-a").await);

    let handles: Vec<_> = (0..10)
        .map(|n| {
            let repo = repo.clone();
            tokio::spawn(async move {
                repo.create_item(ItemSnapshot::titled(format!("Book {n}")))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(repo.items().await.len(), 10);
    assert_eq!(repo.clock().await.timestamp("device-a"), 10);
    let mut dots: Vec<u64> = repo
        .store()
        .get_all_events()
        .await
        .unwrap()
        .iter()
        .map(|e| e.clock.timestamp("device-a"))
        .collect();
    dots.sort_unstable();
    assert_eq!(dots, (1..=10).collect::<Vec<_>>());
}
