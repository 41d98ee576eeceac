//! Direct device-to-device sync on the local network.
//!
//! Peers find each other through a [`Discovery`] backend, then exchange
//! their observed frontiers and the events the other side is missing over
//! a TCP session. Received events are folded through the same repository
//! path as cloud events. Discovery restarts when the host's network
//! interfaces change.

mod connection;
mod discovery;
mod network;
mod protocol;

pub use connection::{PeerConnection, SessionOutcome};
pub use discovery::{Beacon, Discovery, DiscoveryEvent, StaticDiscovery, UdpDiscovery};
pub use network::{restart_on_network_change, spawn_network_watcher};
pub use protocol::{
    batches, read_frame, write_frame, PeerDevice, PeerMessage, BATCH_BYTES, MAX_FRAME, SERVICE_TYPE,
};

use crate::config::ReplicaConfig;
use crate::identity::DeviceIdentity;
use crate::repository::ReplicaRepository;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shelf_engine::DeviceId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("unknown peer device: {0}")]
    InvalidDevice(DeviceId),

    #[error("no connected devices")]
    NoConnectedDevices,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer did not answer in time")]
    Timeout,

    #[error(transparent)]
    Repository(#[from] crate::Error),
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Protocol(format!("malformed message: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    pub listen_addr: SocketAddr,
    pub sync_interval: Duration,
    /// Bound on connect and on every message round trip
    pub io_timeout: Duration,
}

impl From<&ReplicaConfig> for PeerSettings {
    fn from(config: &ReplicaConfig) -> Self {
        Self {
            listen_addr: config.peer_listen_addr(),
            sync_interval: config.peer_sync_interval,
            io_timeout: config.request_timeout,
        }
    }
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub device: PeerDevice,
    pub addr: SocketAddr,
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

pub struct PeerSyncEngine {
    repository: Arc<ReplicaRepository>,
    identity: DeviceIdentity,
    discovery: Arc<dyn Discovery>,
    settings: PeerSettings,
    devices: DashMap<DeviceId, ConnectedPeer>,
    local_addr: std::sync::OnceLock<SocketAddr>,
    tasks: Mutex<Tasks>,
}

impl PeerSyncEngine {
    pub fn new(
        repository: Arc<ReplicaRepository>,
        identity: DeviceIdentity,
        discovery: Arc<dyn Discovery>,
        settings: PeerSettings,
    ) -> Self {
        Self {
            repository,
            identity,
            discovery,
            settings,
            devices: DashMap::new(),
            local_addr: std::sync::OnceLock::new(),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Bind the listener, start advertising and browsing, and start the
    /// periodic sync timer. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, PeerError> {
        let listener = TcpListener::bind(self.settings.listen_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        tracing::info!(%addr, device_id = %self.identity.device_id, "peer listener started");

        let mut tasks = self.tasks.lock().await;
        tasks.listener = Some(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        tasks.discovery = Some(self.start_discovery(addr).await?);
        tasks.timer = Some(tokio::spawn(Arc::clone(self).sync_timer()));
        Ok(addr)
    }

    /// Re-run discovery after a network change. Known peers are forgotten
    /// and found again.
    ///
    /// If discovery cannot be started again the known peers are kept, and
    /// the sync timer retries the start on its next tick.
    pub async fn restart(self: &Arc<Self>) -> Result<(), PeerError> {
        let Some(addr) = self.local_addr.get().copied() else {
            return Err(PeerError::Protocol("peer engine not started".into()));
        };
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.discovery.take() {
            task.abort();
            let _ = task.await;
        }
        self.discovery.stop().await;

        let known: Vec<ConnectedPeer> = self.connected_devices();
        self.devices.clear();
        match self.start_discovery(addr).await {
            Ok(task) => {
                tasks.discovery = Some(task);
                tracing::info!("peer discovery restarted");
                Ok(())
            }
            Err(err) => {
                for peer in known {
                    self.devices.insert(peer.device.device_id().to_string(), peer);
                }
                tracing::warn!(error = %err, "failed to restart peer discovery");
                Err(err)
            }
        }
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in [tasks.listener.take(), tasks.discovery.take(), tasks.timer.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
            let _ = task.await;
        }
        self.discovery.stop().await;
        self.devices.clear();
    }

    /// Whether discovery is currently running.
    pub async fn is_discovering(&self) -> bool {
        self.tasks.lock().await.discovery.is_some()
    }

    /// Start discovery again if an earlier restart left it stopped.
    async fn ensure_discovery(self: &Arc<Self>) {
        let Some(addr) = self.local_addr.get().copied() else {
            return;
        };
        let mut tasks = self.tasks.lock().await;
        if tasks.discovery.is_some() {
            return;
        }
        match self.start_discovery(addr).await {
            Ok(task) => {
                tasks.discovery = Some(task);
                tracing::info!("peer discovery recovered");
            }
            Err(err) => tracing::warn!(error = %err, "peer discovery still unavailable"),
        }
    }

    pub fn connected_devices(&self) -> Vec<ConnectedPeer> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Sync with one discovered peer.
    pub async fn sync_with(&self, device_id: &str) -> Result<SessionOutcome, PeerError> {
        let addr = self
            .devices
            .get(device_id)
            .map(|peer| peer.addr)
            .ok_or_else(|| PeerError::InvalidDevice(device_id.to_string()))?;

        let outcome = self.sync_with_addr(addr).await?;
        if outcome.peer.device_id != device_id {
            return Err(PeerError::Protocol(format!(
                "expected device {device_id}, reached {}",
                outcome.peer.device_id
            )));
        }
        if let Some(mut peer) = self.devices.get_mut(device_id) {
            peer.last_synced = Some(Utc::now());
        }
        Ok(outcome)
    }

    /// Sync with every discovered peer in turn. Individual failures are
    /// logged and returned alongside successes.
    pub async fn sync_all(&self) -> Result<Vec<(DeviceId, Result<SessionOutcome, PeerError>)>, PeerError> {
        let ids: Vec<DeviceId> = self.devices.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return Err(PeerError::NoConnectedDevices);
        }

        let mut results = Vec::with_capacity(ids.len());
        for device_id in ids {
            let result = self.sync_with(&device_id).await;
            if let Err(err) = &result {
                tracing::warn!(peer = %device_id, error = %err, "peer sync failed");
            }
            results.push((device_id, result));
        }
        Ok(results)
    }

    /// Sync with whatever peer listens at `addr`.
    pub async fn sync_with_addr(&self, addr: SocketAddr) -> Result<SessionOutcome, PeerError> {
        let stream = tokio::time::timeout(self.settings.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        PeerConnection::new(stream, &self.repository, &self.identity, self.settings.io_timeout)
            .initiate()
            .await
    }

    async fn start_discovery(self: &Arc<Self>, addr: SocketAddr) -> Result<JoinHandle<()>, PeerError> {
        let local = PeerDevice {
            identity: self.identity.clone(),
            port: addr.port(),
        };
        let events = self.discovery.start(local).await?;
        Ok(tokio::spawn(Arc::clone(self).track_discovery(events)))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "peer accept failed");
                    continue;
                }
            };
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                let session = PeerConnection::new(
                    stream,
                    &engine.repository,
                    &engine.identity,
                    engine.settings.io_timeout,
                );
                match session.respond().await {
                    Ok(outcome) => tracing::info!(
                        peer = %outcome.peer.device_id,
                        %remote,
                        sent = outcome.sent,
                        applied = outcome.received.applied,
                        "served peer sync"
                    ),
                    Err(err) => tracing::warn!(%remote, error = %err, "inbound peer session failed"),
                }
            });
        }
    }

    async fn track_discovery(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::Found { device, addr } => {
                    if device.device_id() == self.identity.device_id {
                        continue;
                    }
                    let device_id = device.device_id().to_string();
                    self.devices.insert(
                        device_id.clone(),
                        ConnectedPeer {
                            device,
                            addr,
                            last_synced: None,
                        },
                    );
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = engine.sync_with(&device_id).await {
                            tracing::warn!(peer = %device_id, error = %err, "initial peer sync failed");
                        }
                    });
                }
                DiscoveryEvent::Lost { device_id } => {
                    self.devices.remove(&device_id);
                }
            }
        }
    }

    async fn sync_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.ensure_discovery().await;
            match self.sync_all().await {
                Ok(results) => {
                    let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
                    tracing::debug!(peers = results.len(), ok, "periodic peer sync");
                }
                Err(PeerError::NoConnectedDevices) => {}
                Err(err) => tracing::warn!(error = %err, "periodic peer sync failed"),
            }
        }
    }
}
