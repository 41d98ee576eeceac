//! In-process backend shared by several providers, for tests and demos.

use super::{DeviceInfo, PullResult, PushResult, SyncError, SyncProvider, SyncResult};
use crate::identity::Identity;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use shelf_engine::{Conflict, ConflictResolution, DeviceId, DomainEvent, EventId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const UPDATE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Account {
    /// Events keyed by the server timestamp they were recorded at.
    log: BTreeMap<Timestamp, DomainEvent>,
    index: HashMap<EventId, Timestamp>,
    devices: BTreeMap<DeviceId, DeviceInfo>,
}

impl Account {
    fn record(&mut self, seq: Timestamp, event: DomainEvent) {
        if let Some(old) = self.index.insert(event.event_id, seq) {
            self.log.remove(&old);
        }
        self.log.insert(seq, event);
    }

    fn get(&self, event_id: &EventId) -> Option<&DomainEvent> {
        self.index.get(event_id).and_then(|seq| self.log.get(seq))
    }
}

#[derive(Debug, Default)]
struct BackendState {
    accounts: HashMap<String, Account>,
    /// Logical server clock, bumped per recorded event.
    seq: Timestamp,
    offline: bool,
    max_batch: Option<usize>,
}

impl BackendState {
    fn check_online(&self) -> SyncResult<()> {
        if self.offline {
            return Err(SyncError::Network("backend unreachable".into()));
        }
        Ok(())
    }

    fn next_seq(&mut self) -> Timestamp {
        self.seq += 1;
        self.seq
    }
}

/// A sync backend living in memory. Clones share the same data.
///
/// Push is idempotent by event id, and every account has its own log.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    updates: broadcast::Sender<(String, DomainEvent)>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            updates,
        }
    }

    /// Simulate losing the network: every call fails until set back.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Reject pushes larger than `max_batch` events.
    pub async fn set_quota(&self, max_batch: Option<usize>) {
        self.state.lock().await.max_batch = max_batch;
    }

    /// Events held for `identity`, in server order.
    pub async fn events(&self, identity: &str) -> Vec<DomainEvent> {
        self.state
            .lock()
            .await
            .accounts
            .get(identity)
            .map(|account| account.log.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn push(&self, identity: &str, events: &[DomainEvent]) -> SyncResult<PushResult> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        if state.max_batch.is_some_and(|max| events.len() > max) {
            return Err(SyncError::QuotaExceeded);
        }

        let mut result = PushResult::default();
        let mut recorded = Vec::new();
        for event in events {
            let existing = state
                .accounts
                .get(identity)
                .and_then(|account| account.get(&event.event_id))
                .cloned();
            match existing {
                Some(stored) if stored == *event => result.accepted.push(event.event_id),
                Some(stored) => match Conflict::detect(event, &stored) {
                    Some(conflict) => result.conflicts.push(conflict),
                    None => result.accepted.push(event.event_id),
                },
                None => {
                    let seq = state.next_seq();
                    state
                        .accounts
                        .entry(identity.to_string())
                        .or_default()
                        .record(seq, event.clone());
                    result.accepted.push(event.event_id);
                    recorded.push(event.clone());
                }
            }
        }
        result.success_count = result.accepted.len();
        result.failure_count = result.conflicts.len();
        result.server_timestamp = state.seq;
        drop(state);

        for event in recorded {
            let _ = self.updates.send((identity.to_string(), event));
        }
        Ok(result)
    }

    pub async fn pull(&self, identity: &str, since: Timestamp, limit: usize) -> SyncResult<PullResult> {
        let state = self.state.lock().await;
        state.check_online()?;
        let Some(account) = state.accounts.get(identity) else {
            return Ok(PullResult {
                server_timestamp: since,
                ..PullResult::default()
            });
        };

        let mut range = account.log.range((Bound::Excluded(since), Bound::Unbounded));
        let page: Vec<(Timestamp, DomainEvent)> = range
            .by_ref()
            .take(limit)
            .map(|(seq, event)| (*seq, event.clone()))
            .collect();
        let has_more = range.next().is_some();
        let server_timestamp = page.last().map_or(since, |(seq, _)| *seq);

        Ok(PullResult {
            events: page.into_iter().map(|(_, event)| event).collect(),
            has_more,
            server_timestamp,
        })
    }

    pub async fn latest(&self, identity: &str) -> SyncResult<Timestamp> {
        let state = self.state.lock().await;
        state.check_online()?;
        Ok(state
            .accounts
            .get(identity)
            .and_then(|account| account.log.keys().next_back().copied())
            .unwrap_or(0))
    }

    /// Settle push conflicts against the stored copies. A pushed copy that
    /// wins replaces the stored one and is re-recorded so other devices
    /// pull it.
    pub async fn resolve(&self, identity: &str, conflicts: &[Conflict]) -> SyncResult<Vec<DomainEvent>> {
        let mut state = self.state.lock().await;
        state.check_online()?;

        let mut winners = Vec::with_capacity(conflicts.len());
        let mut recorded = Vec::new();
        for conflict in conflicts {
            let pushed = &conflict.local;
            let stored = state
                .accounts
                .get(identity)
                .and_then(|account| account.get(&pushed.event_id))
                .cloned()
                .ok_or_else(|| {
                    SyncError::ConflictResolutionFailed(format!(
                        "no stored event {}",
                        pushed.event_id
                    ))
                })?;

            let winner = match Conflict::detect(&stored, pushed).map(|c| c.resolve()) {
                Some(ConflictResolution::RemoteWins) => {
                    let seq = state.next_seq();
                    state
                        .accounts
                        .entry(identity.to_string())
                        .or_default()
                        .record(seq, pushed.clone());
                    recorded.push(pushed.clone());
                    pushed.clone()
                }
                _ => stored,
            };
            winners.push(winner);
        }
        drop(state);

        for event in recorded {
            let _ = self.updates.send((identity.to_string(), event));
        }
        Ok(winners)
    }

    pub async fn register_device(&self, identity: &str, device: DeviceInfo) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        state
            .accounts
            .entry(identity.to_string())
            .or_default()
            .devices
            .insert(device.device_id.clone(), device);
        Ok(())
    }

    pub async fn devices(&self, identity: &str) -> SyncResult<Vec<DeviceInfo>> {
        let state = self.state.lock().await;
        state.check_online()?;
        Ok(state
            .accounts
            .get(identity)
            .map(|account| account.devices.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Events newly recorded for `identity`.
    pub fn subscribe(&self, identity: &str) -> BoxStream<'static, SyncResult<DomainEvent>> {
        let identity = identity.to_string();
        stream::unfold(Some(self.updates.subscribe()), move |rx| {
            let identity = identity.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok((owner, event)) if owner == identity => return Some((Ok(event), Some(rx))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let err = SyncError::Unknown(format!("missed {missed} updates"));
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

/// A [`SyncProvider`] backed by a [`MemoryBackend`], acting as whoever
/// `identity` currently names.
pub struct MemorySyncProvider {
    backend: MemoryBackend,
    identity: Identity,
    connected: AtomicBool,
}

impl MemorySyncProvider {
    pub fn new(backend: MemoryBackend, identity: Identity) -> Self {
        Self {
            backend,
            identity,
            connected: AtomicBool::new(false),
        }
    }

    fn session(&self) -> SyncResult<String> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.identity.current().ok_or(SyncError::AuthenticationRequired)
    }
}

#[async_trait]
impl SyncProvider for MemorySyncProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> SyncResult<()> {
        let identity = self.identity.current().ok_or(SyncError::AuthenticationRequired)?;
        self.backend.latest(&identity).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let identity = self.session()?;
        self.backend.latest(&identity).await.map(|_| ())
    }

    async fn push_events(&self, events: &[DomainEvent]) -> SyncResult<PushResult> {
        let identity = self.session()?;
        self.backend.push(&identity, events).await
    }

    async fn pull_events(&self, since: Timestamp, limit: usize) -> SyncResult<PullResult> {
        let identity = self.session()?;
        self.backend.pull(&identity, since, limit).await
    }

    async fn get_latest_timestamp(&self) -> SyncResult<Timestamp> {
        let identity = self.session()?;
        self.backend.latest(&identity).await
    }

    async fn subscribe_to_updates(
        &self,
    ) -> SyncResult<BoxStream<'static, SyncResult<DomainEvent>>> {
        let identity = self.session()?;
        Ok(self.backend.subscribe(&identity))
    }

    async fn resolve_conflicts(&self, conflicts: &[Conflict]) -> SyncResult<Vec<DomainEvent>> {
        let identity = self.session()?;
        self.backend.resolve(&identity, conflicts).await
    }

    async fn register_device(&self, device: &DeviceInfo) -> SyncResult<()> {
        let identity = self.session()?;
        self.backend.register_device(&identity, device.clone()).await
    }

    async fn get_connected_devices(&self) -> SyncResult<Vec<DeviceInfo>> {
        let identity = self.session()?;
        self.backend.devices(&identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_engine::{EventPayload, ItemEvent, ItemSnapshot, VectorClock};
    use uuid::Uuid;

    fn event(device: &str, counter: u64) -> DomainEvent {
        DomainEvent::new(
            Uuid::new_v4(),
            device,
            counter,
            1,
            VectorClock::from_entries([(device, counter)]),
            EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled("Dune"))),
        )
    }

    async fn connected(backend: &MemoryBackend, identity: &str) -> MemorySyncProvider {
        let provider = MemorySyncProvider::new(backend.clone(), Identity::new(Some(identity.into())));
        provider.connect().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn push_is_idempotent() {
        let backend = MemoryBackend::new();
        let provider = connected(&backend, "alice").await;
        let e = event("a", 1);

        let first = provider.push_events(&[e.clone()]).await.unwrap();
        let retry = provider.push_events(&[e.clone()]).await.unwrap();
        assert_eq!(first.success_count, 1);
        assert_eq!(retry.accepted, vec![e.event_id]);
        assert_eq!(backend.events("alice").await, vec![e]);
    }

    #[tokio::test]
    async fn pull_pages_by_server_timestamp() {
        let backend = MemoryBackend::new();
        let provider = connected(&backend, "alice").await;
        let events: Vec<_> = (1..=5).map(|n| event("a", n)).collect();
        provider.push_events(&events).await.unwrap();

        let page = provider.pull_events(0, 2).await.unwrap();
        assert_eq!(page.events, events[..2]);
        assert!(page.has_more);

        let rest = provider.pull_events(page.server_timestamp, 10).await.unwrap();
        assert_eq!(rest.events, events[2..]);
        assert!(!rest.has_more);
        assert_eq!(provider.get_latest_timestamp().await.unwrap(), rest.server_timestamp);
    }

    #[tokio::test]
    async fn accounts_are_isolated() {
        let backend = MemoryBackend::new();
        let alice = connected(&backend, "alice").await;
        let bob = connected(&backend, "bob").await;
        alice.push_events(&[event("a", 1)]).await.unwrap();

        assert!(bob.pull_events(0, 10).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn faults_surface_as_errors() {
        let backend = MemoryBackend::new();
        let provider = connected(&backend, "alice").await;

        backend.set_quota(Some(1)).await;
        assert!(matches!(
            provider.push_events(&[event("a", 1), event("a", 2)]).await,
            Err(SyncError::QuotaExceeded)
        ));

        backend.set_offline(true).await;
        assert!(matches!(
            provider.pull_events(0, 10).await,
            Err(SyncError::Network(_))
        ));

        let signed_out = MemorySyncProvider::new(backend.clone(), Identity::anonymous());
        assert!(matches!(
            signed_out.connect().await,
            Err(SyncError::AuthenticationRequired)
        ));
        assert!(matches!(
            signed_out.pull_events(0, 1).await,
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn conflicting_push_is_resolved() {
        let backend = MemoryBackend::new();
        let provider = connected(&backend, "alice").await;
        let stored = event("a", 1);
        provider.push_events(&[stored.clone()]).await.unwrap();

        let mut later = stored.clone();
        later.clock = stored.clock.incremented("b");
        let result = provider.push_events(&[later.clone()]).await.unwrap();
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.accepted.is_empty());

        let winners = provider.resolve_conflicts(&result.conflicts).await.unwrap();
        assert_eq!(winners, vec![later.clone()]);
        assert_eq!(backend.events("alice").await, vec![later]);
    }

    #[tokio::test]
    async fn subscribers_see_new_events() {
        let backend = MemoryBackend::new();
        let provider = connected(&backend, "alice").await;
        let mut updates = provider.subscribe_to_updates().await.unwrap();

        let e = event("a", 1);
        provider.push_events(&[e.clone()]).await.unwrap();
        assert_eq!(updates.next().await.unwrap().unwrap(), e);
    }

    #[tokio::test]
    async fn device_registry() {
        let backend = MemoryBackend::new();
        let provider = connected(&backend, "alice").await;
        let device = DeviceInfo {
            device_id: "a".into(),
            name: "Laptop".into(),
            platform: "linux".into(),
            last_seen: 1,
        };
        provider.register_device(&device).await.unwrap();
        provider.register_device(&device).await.unwrap();
        assert_eq!(provider.get_connected_devices().await.unwrap(), vec![device]);
    }
}
