//! The replica repository: materialized state over the event log.
//!
//! Every change, local or remote, goes through the same path: persist the
//! event, then fold it into [`ReplicaState`]. The state and the local clock
//! sit behind one write lock so folds never interleave.

use crate::db::{EventStore, SyncState};
use crate::error::{Error, Result};
use crate::now_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_engine::{
    normalize_isbn, AggregateId, Conflict, ConflictResolution, DeviceId, DomainEvent,
    EventPayload, InventoryItem, IsbnMapping, ItemEvent, ItemField, ItemSnapshot, Location,
    LocationEvent, LocationField, LocationSnapshot, MappingEvent, MappingSnapshot, ReplicaState,
    VectorClock,
};
use std::collections::BTreeSet;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const REPLAY_BATCH: usize = 500;
const CHANGE_CAPACITY: usize = 256;
/// Device setting holding the local clock as of the last log pruning.
const PRUNED_CLOCK_KEY: &str = "pruned_clock";

/// Outcome of folding a batch of remote events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// New events persisted and folded
    pub applied: usize,
    /// Identical copies of events already stored
    pub duplicates: usize,
    /// Same id, different content
    pub conflicts: Vec<Conflict>,
    /// Events addressed to an id of another aggregate family
    pub rejected: usize,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.conflicts.extend(other.conflicts);
        self.rejected += other.rejected;
    }
}

struct Inner {
    state: ReplicaState,
    /// Local clock; bumped for every event this device issues.
    clock: VectorClock,
}

pub struct ReplicaRepository {
    device_id: DeviceId,
    store: EventStore,
    sync_state: SyncState,
    inner: RwLock<Inner>,
    changes: broadcast::Sender<DomainEvent>,
}

impl ReplicaRepository {
    /// Rebuild state by replaying the whole log, then the remote conflict
    /// winners.
    pub async fn open(store: EventStore, sync_state: SyncState, device_id: DeviceId) -> Result<Self> {
        let mut state = ReplicaState::new();
        let mut replayed = 0usize;
        let mut stream = store.stream(REPLAY_BATCH);
        while let Some(batch) = stream.next_batch().await? {
            for event in &batch {
                match state.apply(event) {
                    Ok(()) => replayed += 1,
                    Err(err) => {
                        tracing::warn!(event_id = %event.event_id, error = %err, "skipping event on replay")
                    }
                }
            }
        }

        let winners = sync_state.remote_winners().await?;
        for event in &winners {
            if let Err(err) = state.apply(event) {
                tracing::warn!(event_id = %event.event_id, error = %err, "skipping conflict winner");
            }
        }

        let mut clock = state.clock().clone();
        if let Some(raw) = sync_state.device_value(PRUNED_CLOCK_KEY).await? {
            clock.merge(&serde_json::from_str(&raw)?);
        }

        tracing::info!(
            device_id = %device_id,
            replayed,
            conflict_winners = winners.len(),
            items = state.items().len(),
            locations = state.locations().len(),
            "replica state rebuilt"
        );

        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self {
            device_id,
            store,
            sync_state,
            inner: RwLock::new(Inner { state, clock }),
            changes,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync_state
    }

    /// Every event persisted by this repository, local or remote.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.changes.subscribe()
    }

    /// Stamp, persist and fold one locally issued event.
    async fn emit(
        &self,
        inner: &mut Inner,
        aggregate_id: AggregateId,
        payload: EventPayload,
    ) -> Result<DomainEvent> {
        let version = self.store.get_current_version(aggregate_id).await? + 1;
        let clock = inner.clock.incremented(&self.device_id);
        let event = DomainEvent::new(
            aggregate_id,
            self.device_id.clone(),
            now_millis(),
            version,
            clock,
            payload,
        );

        self.store.save_event(&event).await?;
        inner.state.apply(&event)?;
        inner.clock.merge(&event.clock);

        tracing::debug!(
            event_id = %event.event_id,
            aggregate_id = %aggregate_id,
            event_type = event.event_type(),
            version,
            "emitted event"
        );
        let _ = self.changes.send(event.clone());
        Ok(event)
    }

    // Items

    pub async fn create_item(&self, snapshot: ItemSnapshot) -> Result<AggregateId> {
        let snapshot = snapshot.validated()?;
        let mut inner = self.inner.write().await;
        if let Some(location_id) = snapshot.location_id {
            require(inner.state.location(location_id), location_id)?;
        }
        let id = Uuid::new_v4();
        self.emit(&mut inner, id, EventPayload::Item(ItemEvent::Created(snapshot)))
            .await?;
        Ok(id)
    }

    /// Write only the supplied fields. An empty list is a no-op.
    pub async fn update_item(&self, id: AggregateId, fields: Vec<ItemField>) -> Result<()> {
        let fields = fields
            .into_iter()
            .map(ItemField::validated)
            .collect::<shelf_engine::Result<Vec<_>>>()?;
        let mut inner = self.inner.write().await;
        require(inner.state.item(id), id)?;
        if fields.is_empty() {
            return Ok(());
        }
        self.emit(&mut inner, id, EventPayload::Item(ItemEvent::Updated(fields.into())))
            .await?;
        Ok(())
    }

    /// Replace the item's tags with `tags`, removing only the tag adds this
    /// replica has seen.
    pub async fn set_item_tags(&self, id: AggregateId, tags: BTreeSet<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        require(inner.state.item(id), id)?;
        let delta = match inner.state.crdt_item(id) {
            Some(item) => item.tag_delta(&tags),
            None => return Err(Error::AggregateNotFound(id)),
        };
        if delta.is_empty() {
            return Ok(());
        }
        let changes = vec![ItemField::Tags(delta)].into();
        self.emit(&mut inner, id, EventPayload::Item(ItemEvent::Updated(changes)))
            .await?;
        Ok(())
    }

    pub async fn delete_item(&self, id: AggregateId) -> Result<()> {
        let mut inner = self.inner.write().await;
        require(inner.state.item(id), id)?;
        self.emit(&mut inner, id, EventPayload::Item(ItemEvent::Deleted))
            .await?;
        Ok(())
    }

    /// Undo a delete this replica has observed.
    pub async fn restore_item(&self, id: AggregateId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let deleted = inner
            .state
            .crdt_item(id)
            .is_some_and(|item| item.lifecycle().is_created() && item.is_deleted());
        if !deleted {
            return Err(Error::AggregateNotFound(id));
        }
        self.emit(&mut inner, id, EventPayload::Item(ItemEvent::Restored))
            .await?;
        Ok(())
    }

    pub async fn move_item(&self, id: AggregateId, location_id: Option<AggregateId>) -> Result<()> {
        let mut inner = self.inner.write().await;
        require(inner.state.item(id), id)?;
        if let Some(location_id) = location_id {
            require(inner.state.location(location_id), location_id)?;
        }
        let payload = EventPayload::Item(ItemEvent::LocationChanged { location_id });
        self.emit(&mut inner, id, payload).await?;
        Ok(())
    }

    // Locations

    pub async fn create_location(&self, snapshot: LocationSnapshot) -> Result<AggregateId> {
        let snapshot = snapshot.validated()?;
        let mut inner = self.inner.write().await;
        if let Some(parent_id) = snapshot.parent_id {
            require(inner.state.location(parent_id), parent_id)?;
        }
        let id = Uuid::new_v4();
        self.emit(
            &mut inner,
            id,
            EventPayload::Location(LocationEvent::Created(snapshot)),
        )
        .await?;
        Ok(id)
    }

    pub async fn update_location(&self, id: AggregateId, fields: Vec<LocationField>) -> Result<()> {
        let fields = fields
            .into_iter()
            .map(LocationField::validated)
            .collect::<shelf_engine::Result<Vec<_>>>()?;
        let mut inner = self.inner.write().await;
        require(inner.state.location(id), id)?;
        if fields.is_empty() {
            return Ok(());
        }
        self.emit(
            &mut inner,
            id,
            EventPayload::Location(LocationEvent::Updated(fields.into())),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_location(&self, id: AggregateId) -> Result<()> {
        let mut inner = self.inner.write().await;
        require(inner.state.location(id), id)?;
        self.emit(&mut inner, id, EventPayload::Location(LocationEvent::Deleted))
            .await?;
        Ok(())
    }

    /// Reparent a location. Moving a location under itself or one of its
    /// descendants is rejected.
    pub async fn move_location(&self, id: AggregateId, parent_id: Option<AggregateId>) -> Result<()> {
        let mut inner = self.inner.write().await;
        require(inner.state.location(id), id)?;
        if let Some(parent_id) = parent_id {
            require(inner.state.location(parent_id), parent_id)?;
            if inner.state.is_location_descendant(parent_id, id) {
                return Err(shelf_engine::Error::InvalidField {
                    field: "parentId".into(),
                    reason: format!("{parent_id} is {id} or one of its descendants"),
                }
                .into());
            }
        }
        let payload = EventPayload::Location(LocationEvent::ParentChanged { parent_id });
        self.emit(&mut inner, id, payload).await?;
        Ok(())
    }

    // Identifier mappings

    /// Map an ISBN to an item. Fails if the ISBN is already mapped.
    pub async fn create_mapping(&self, isbn: &str, item_id: AggregateId) -> Result<AggregateId> {
        let isbn = normalize_isbn(isbn)?;
        let mut inner = self.inner.write().await;
        require(inner.state.item(item_id), item_id)?;
        if inner.state.mapping_for_isbn(&isbn).is_some() {
            return Err(Error::AggregateAlreadyExists(isbn));
        }
        let id = Uuid::new_v4();
        let payload = EventPayload::Mapping(MappingEvent::Created(MappingSnapshot { isbn, item_id }));
        self.emit(&mut inner, id, payload).await?;
        Ok(id)
    }

    pub async fn delete_mapping(&self, id: AggregateId) -> Result<()> {
        let mut inner = self.inner.write().await;
        require(inner.state.mapping(id), id)?;
        self.emit(&mut inner, id, EventPayload::Mapping(MappingEvent::Deleted))
            .await?;
        Ok(())
    }

    // Remote events

    /// Persist and fold events received from the cloud or a peer.
    ///
    /// Known ids are either duplicates (skipped) or conflicts, which are
    /// resolved and recorded; a remote winner is folded on top of the local
    /// copy. Progress is committed per event.
    pub async fn sync_events(&self, events: &[DomainEvent]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut inner = self.inner.write().await;

        for event in events {
            if let Some(local) = self.store.get_event(event.event_id).await? {
                match Conflict::detect(&local, event) {
                    None => report.duplicates += 1,
                    Some(conflict) => {
                        let resolution = conflict.resolve();
                        tracing::info!(
                            event_id = %event.event_id,
                            kind = ?conflict.kind,
                            ?resolution,
                            "resolved event conflict"
                        );
                        self.sync_state.record_conflict(&conflict, resolution).await?;
                        if resolution == ConflictResolution::RemoteWins {
                            inner.state.apply(event)?;
                            inner.clock.merge(&event.clock);
                        }
                        report.conflicts.push(conflict);
                    }
                }
                continue;
            }

            if let Some(actual) = inner.state.aggregate_type(event.aggregate_id) {
                if actual != event.aggregate_type() {
                    tracing::warn!(
                        event_id = %event.event_id,
                        aggregate_id = %event.aggregate_id,
                        expected = %actual,
                        "rejecting event for aggregate of another type"
                    );
                    report.rejected += 1;
                    continue;
                }
            }

            self.store.save_event(event).await?;
            inner.state.apply(event)?;
            inner.clock.merge(&event.clock);
            report.applied += 1;
            let _ = self.changes.send(event.clone());
        }

        if !events.is_empty() {
            tracing::debug!(
                received = events.len(),
                applied = report.applied,
                duplicates = report.duplicates,
                conflicts = report.conflicts.len(),
                rejected = report.rejected,
                "folded remote events"
            );
        }
        Ok(report)
    }

    /// Combine another replica's full state into memory.
    ///
    /// Nothing is persisted: the merged aggregates are lost on restart
    /// unless their events also arrive through [`Self::sync_events`].
    pub async fn merge_state(&self, other: &ReplicaState) {
        let mut inner = self.inner.write().await;
        inner.state.merge(other);
        inner.clock.merge(other.clock());
    }

    /// Stored events the holder of `frontier` has not folded.
    pub async fn events_missing_from(&self, frontier: &VectorClock) -> Result<Vec<DomainEvent>> {
        let mut missing = Vec::new();
        let mut stream = self.store.stream(REPLAY_BATCH);
        while let Some(batch) = stream.next_batch().await? {
            missing.extend(batch.into_iter().filter(|event| {
                event.clock.timestamp(&event.device_id) > frontier.timestamp(&event.device_id)
            }));
        }
        Ok(missing)
    }

    /// Prune the log, keeping the local clock so dots are never reused.
    pub async fn prune_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let inner = self.inner.write().await;
        self.sync_state
            .set_device_value(PRUNED_CLOCK_KEY, &serde_json::to_string(&inner.clock)?)
            .await?;
        self.store.delete_events_older_than(cutoff).await
    }

    // Readers

    pub async fn item(&self, id: AggregateId) -> Option<InventoryItem> {
        self.inner.read().await.state.item(id)
    }

    pub async fn items(&self) -> Vec<InventoryItem> {
        self.inner.read().await.state.items()
    }

    pub async fn items_at(&self, location_id: AggregateId) -> Vec<InventoryItem> {
        self.inner.read().await.state.items_at(location_id)
    }

    pub async fn deleted_items(&self) -> Vec<InventoryItem> {
        self.inner.read().await.state.deleted_items()
    }

    pub async fn location(&self, id: AggregateId) -> Option<Location> {
        self.inner.read().await.state.location(id)
    }

    pub async fn locations(&self) -> Vec<Location> {
        self.inner.read().await.state.locations()
    }

    pub async fn child_locations(&self, parent_id: Option<AggregateId>) -> Vec<Location> {
        self.inner.read().await.state.child_locations(parent_id)
    }

    pub async fn mapping(&self, id: AggregateId) -> Option<IsbnMapping> {
        self.inner.read().await.state.mapping(id)
    }

    pub async fn mappings(&self) -> Vec<IsbnMapping> {
        self.inner.read().await.state.mappings()
    }

    pub async fn mapping_for_isbn(&self, isbn: &str) -> Option<IsbnMapping> {
        let isbn = normalize_isbn(isbn).ok()?;
        self.inner.read().await.state.mapping_for_isbn(&isbn)
    }

    /// A copy of the full CRDT state, tombstones included.
    pub async fn snapshot(&self) -> ReplicaState {
        self.inner.read().await.state.clone()
    }

    pub async fn clock(&self) -> VectorClock {
        self.inner.read().await.clock.clone()
    }

    /// Per-device prefix of events folded here.
    pub async fn frontier(&self) -> VectorClock {
        self.inner.read().await.state.frontier()
    }
}

fn require<T>(found: Option<T>, id: AggregateId) -> Result<T> {
    found.ok_or(Error::AggregateNotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, run_migrations};

    async fn repository(device: &str) -> ReplicaRepository {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        ReplicaRepository::open(
            EventStore::new(pool.clone()),
            SyncState::new(pool),
            device.to_string(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn local_events_bump_clock_and_version() {
        let repo = repository("device-a").await;
        let id = repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
        repo.update_item(id, vec![ItemField::Notes(Some("signed".into()))])
            .await
            .unwrap();

        let events = repo.store().get_events(id, None).await.unwrap();
        assert_eq!(events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(events[1].clock.timestamp("device-a"), 2);
        assert_eq!(repo.clock().await.timestamp("device-a"), 2);
        assert_eq!(repo.item(id).await.unwrap().notes.as_deref(), Some("signed"));
    }

    #[tokio::test]
    async fn missing_aggregates_are_reported() {
        let repo = repository("device-a").await;
        let ghost = Uuid::new_v4();
        assert!(matches!(
            repo.update_item(ghost, vec![]).await,
            Err(Error::AggregateNotFound(id)) if id == ghost
        ));
        assert!(matches!(
            repo.delete_location(ghost).await,
            Err(Error::AggregateNotFound(_))
        ));
        assert!(matches!(
            repo.move_item(ghost, None).await,
            Err(Error::AggregateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn location_cycles_are_rejected() {
        let repo = repository("device-a").await;
        let room = repo.create_location(LocationSnapshot::named("Study")).await.unwrap();
        let shelf = repo
            .create_location(LocationSnapshot {
                parent_id: Some(room),
                ..LocationSnapshot::named("Top shelf")
            })
            .await
            .unwrap();

        let err = repo.move_location(room, Some(shelf)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Engine(shelf_engine::Error::InvalidField { .. })
        ));
        assert_eq!(repo.child_locations(Some(room)).await.len(), 1);
    }

    #[tokio::test]
    async fn tags_replace_observed_set() {
        let repo = repository("device-a").await;
        let id = repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
        repo.set_item_tags(id, BTreeSet::from(["scifi".to_string(), "classic".to_string()]))
            .await
            .unwrap();
        repo.set_item_tags(id, BTreeSet::from(["classic".to_string()]))
            .await
            .unwrap();

        assert_eq!(
            repo.item(id).await.unwrap().tags,
            BTreeSet::from(["classic".to_string()])
        );
    }

    #[tokio::test]
    async fn conflicting_copy_is_recorded() {
        let repo = repository("device-a").await;
        let id = repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
        let local = repo.store().get_events(id, None).await.unwrap().remove(0);

        let mut remote = local.clone();
        remote.clock = local.clock.incremented("device-b");
        remote.payload = EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled("Dune Messiah")));

        let report = repo.sync_events(&[local.clone(), remote]).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(repo.sync_state().conflict_count().await.unwrap(), 1);
        assert_eq!(repo.item(id).await.unwrap().title, "Dune Messiah");
    }

    #[tokio::test]
    async fn prune_keeps_clock_monotonic() {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = EventStore::new(pool.clone());
        let state = SyncState::new(pool);

        let repo = ReplicaRepository::open(store.clone(), state.clone(), "device-a".into())
            .await
            .unwrap();
        repo.create_item(ItemSnapshot::titled("Dune")).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::days(1);
        assert_eq!(repo.prune_events_older_than(cutoff).await.unwrap(), 1);
        drop(repo);

        let reopened = ReplicaRepository::open(store, state, "device-a".into())
            .await
            .unwrap();
        assert_eq!(reopened.clock().await.timestamp("device-a"), 1);
    }
}
