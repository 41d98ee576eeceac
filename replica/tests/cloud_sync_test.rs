//! Cloud sync cycles against the in-memory backend.

use shelf_engine::{ItemField, ItemSnapshot, LocationSnapshot};
use shelf_replica::db::{create_memory_pool, run_migrations, EventStore, SyncState};
use shelf_replica::provider::{MemoryBackend, MemorySyncProvider, SyncError};
use shelf_replica::sync::OrchestratorSettings;
use shelf_replica::{CloudSyncOrchestrator, DeviceIdentity, Identity, ReplicaRepository, SyncStatus};
use std::sync::Arc;
use std::time::Duration;

struct Device {
    repo: Arc<ReplicaRepository>,
    sync: Arc<CloudSyncOrchestrator>,
    identity: Identity,
}

async fn device(backend: &MemoryBackend, id: &str, account: Option<&str>) -> Device {
    device_with(backend, id, account, OrchestratorSettings::default()).await
}

async fn device_with(
    backend: &MemoryBackend,
    id: &str,
    account: Option<&str>,
    settings: OrchestratorSettings,
) -> Device {
    let pool = create_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    let repo = Arc::new(
        ReplicaRepository::open(EventStore::new(pool.clone()), SyncState::new(pool), id.into())
            .await
            .unwrap(),
    );
    let identity = Identity::new(account.map(str::to_string));
    let provider = Arc::new(MemorySyncProvider::new(backend.clone(), identity.clone()));
    let sync = Arc::new(CloudSyncOrchestrator::new(
        repo.clone(),
        provider,
        identity.clone(),
        DeviceIdentity::new(id, format!("{id} laptop")),
        settings,
    ));
    Device {
        repo,
        sync,
        identity,
    }
}

#[tokio::test]
async fn two_devices_converge_through_the_backend() {
    let backend = MemoryBackend::new();
    let x = device(&backend, "device-x", Some("alice")).await;
    let y = device(&backend, "device-y", Some("alice")).await;

    let dune = x.repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
    let shelf = y
        .repo
        .create_location(LocationSnapshot::named("Shelf"))
        .await
        .unwrap();

    x.sync.sync_now().await.unwrap();
    let summary = y.sync.sync_now().await.unwrap().unwrap();
    assert_eq!(summary.pushed, 1);
    assert_eq!(summary.pulled.applied, 1);
    x.sync.sync_now().await.unwrap();

    for d in [&x, &y] {
        assert_eq!(d.repo.item(dune).await.unwrap().title, "Dune");
        assert_eq!(d.repo.location(shelf).await.unwrap().name, "Shelf");
        assert_eq!(d.sync.pending_count().await.unwrap(), 0);
    }
    assert_eq!(x.repo.snapshot().await, y.repo.snapshot().await);
    assert!(matches!(x.sync.status(), SyncStatus::Synced { .. }));
}

#[tokio::test]
async fn repeated_sync_keeps_one_copy_per_event() {
    let backend = MemoryBackend::new();
    let x = device(&backend, "device-x", Some("alice")).await;
    let id = x.repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
    x.repo
        .update_item(id, vec![ItemField::PageCount(Some(412))])
        .await
        .unwrap();

    x.sync.sync_now().await.unwrap();
    // the same push again, as when a response is lost and the client retries
    let events = x.repo.store().get_all_events().await.unwrap();
    let provider = MemorySyncProvider::new(backend.clone(), x.identity.clone());
    shelf_replica::SyncProvider::connect(&provider).await.unwrap();
    shelf_replica::SyncProvider::push_events(&provider, &events)
        .await
        .unwrap();
    x.sync.sync_now().await.unwrap();

    assert_eq!(backend.events("alice").await.len(), 2);
    assert_eq!(x.repo.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn signed_out_devices_do_not_sync() {
    let backend = MemoryBackend::new();
    let x = device(&backend, "device-x", None).await;
    x.repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();

    assert_eq!(x.sync.sync_now().await.unwrap(), None);
    assert_eq!(x.sync.status(), SyncStatus::Idle);
    assert!(backend.events("alice").await.is_empty());

    x.identity.set("alice");
    assert_eq!(x.sync.pending_count().await.unwrap(), 1);
    x.sync.sync_now().await.unwrap();
    assert_eq!(backend.events("alice").await.len(), 1);
}

#[tokio::test]
async fn failures_move_to_error_and_recover() {
    let backend = MemoryBackend::new();
    let x = device(&backend, "device-x", Some("alice")).await;
    x.repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();

    backend.set_offline(true).await;
    assert!(matches!(x.sync.sync_now().await, Err(SyncError::Network(_))));
    assert!(x.sync.status().is_error());
    assert_eq!(x.sync.pending_count().await.unwrap(), 1);

    // local writes keep working while sync is failing
    x.repo.create_item(ItemSnapshot::titled("Emma")).await.unwrap();

    backend.set_offline(false).await;
    x.sync.sync_now().await.unwrap();
    assert!(matches!(x.sync.status(), SyncStatus::Synced { .. }));
    assert_eq!(x.sync.pending_count().await.unwrap(), 0);
    assert_eq!(backend.events("alice").await.len(), 2);
}

#[tokio::test]
async fn batches_respect_the_quota() {
    let backend = MemoryBackend::new();
    backend.set_quota(Some(2)).await;

    let big = device(&backend, "device-x", Some("alice")).await;
    let small = device_with(
        &backend,
        "device-y",
        Some("alice"),
        OrchestratorSettings {
            push_batch_size: 2,
            pull_limit: 2,
        },
    )
    .await;
    for n in 0..3 {
        big.repo
            .create_item(ItemSnapshot::titled(format!("Book {n}")))
            .await
            .unwrap();
        small
            .repo
            .create_item(ItemSnapshot::titled(format!("Tome {n}")))
            .await
            .unwrap();
    }

    assert!(matches!(big.sync.sync_now().await, Err(SyncError::QuotaExceeded)));

    let summary = small.sync.sync_now().await.unwrap().unwrap();
    assert_eq!(summary.pushed, 3);
    assert_eq!(backend.events("alice").await.len(), 3);
}

#[tokio::test]
async fn pull_pages_until_exhausted() {
    let backend = MemoryBackend::new();
    let x = device(&backend, "device-x", Some("alice")).await;
    let y = device_with(
        &backend,
        "device-y",
        Some("alice"),
        OrchestratorSettings {
            push_batch_size: 10,
            pull_limit: 2,
        },
    )
    .await;
    for n in 0..5 {
        x.repo
            .create_item(ItemSnapshot::titled(format!("Book {n}")))
            .await
            .unwrap();
    }
    x.sync.sync_now().await.unwrap();

    let summary = y.sync.sync_now().await.unwrap().unwrap();
    assert_eq!(summary.pulled.applied, 5);
    assert_eq!(y.repo.items().await.len(), 5);
    assert_eq!(
        y.repo.sync_state().cursor("alice").await.unwrap(),
        summary.server_timestamp
    );

    let again = y.sync.sync_now().await.unwrap().unwrap();
    assert_eq!(again.pulled.applied, 0);
}

#[tokio::test]
async fn accounts_do_not_leak() {
    let backend = MemoryBackend::new();
    let alice = device(&backend, "device-a", Some("alice")).await;
    let bob = device(&backend, "device-b", Some("bob")).await;
    alice.repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();

    alice.sync.sync_now().await.unwrap();
    bob.sync.sync_now().await.unwrap();
    assert!(bob.repo.items().await.is_empty());
}

#[tokio::test]
async fn live_updates_are_folded() {
    let backend = MemoryBackend::new();
    let x = device(&backend, "device-x", Some("alice")).await;
    let y = device(&backend, "device-y", Some("alice")).await;
    let follower = y.sync.clone().spawn_live_updates();
    // let the follower subscribe
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = x.repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
    x.sync.sync_now().await.unwrap();

    let mut seen = false;
    for _ in 0..50 {
        if y.repo.item(id).await.is_some() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    follower.abort();
    assert!(seen, "live update never arrived");
}
