//! Finding peers on the local network.

use super::protocol::{PeerDevice, SERVICE_TYPE};
use super::PeerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shelf_engine::DeviceId;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;
const MAX_BEACON: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found { device: PeerDevice, addr: SocketAddr },
    Lost { device_id: DeviceId },
}

/// Advertises this device and reports others.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start advertising `local` and browsing. Any previous run is stopped
    /// and its resources released first.
    async fn start(&self, local: PeerDevice) -> Result<mpsc::Receiver<DiscoveryEvent>, PeerError>;

    async fn stop(&self);
}

/// Announcement broadcast over UDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub service: String,
    pub device: PeerDevice,
}

impl Beacon {
    pub fn new(device: PeerDevice) -> Self {
        Self {
            service: SERVICE_TYPE.to_string(),
            device,
        }
    }
}

/// Broadcasts a [`Beacon`] on a fixed UDP port and listens for others.
///
/// A peer is reported lost once no beacon arrived for `peer_ttl`.
pub struct UdpDiscovery {
    port: u16,
    interval: Duration,
    peer_ttl: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpDiscovery {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(20),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration, peer_ttl: Duration) -> Self {
        self.interval = interval;
        self.peer_ttl = peer_ttl;
        self
    }
}

#[async_trait]
impl Discovery for UdpDiscovery {
    async fn start(&self, local: PeerDevice) -> Result<mpsc::Receiver<DiscoveryEvent>, PeerError> {
        self.stop().await;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        socket.set_broadcast(true)?;
        let socket = std::sync::Arc::new(socket);
        let beacon = serde_json::to_vec(&Beacon::new(local.clone()))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let target = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
        let announce = {
            let socket = socket.clone();
            let interval = self.interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Err(err) = socket.send_to(&beacon, target).await {
                        tracing::debug!(error = %err, "failed to send discovery beacon");
                    }
                }
            })
        };

        let browse = tokio::spawn(browse(
            socket,
            local.identity.device_id.clone(),
            tx,
            self.interval,
            self.peer_ttl,
        ));

        tracing::info!(port = self.port, service = SERVICE_TYPE, "peer discovery started");
        self.tasks.lock().await.extend([announce, browse]);
        Ok(rx)
    }

    async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.abort();
            // the socket is released once the task is dropped
            let _ = task.await;
        }
    }
}

async fn browse(
    socket: std::sync::Arc<UdpSocket>,
    own_id: DeviceId,
    tx: mpsc::Sender<DiscoveryEvent>,
    interval: Duration,
    peer_ttl: Duration,
) {
    let mut seen: HashMap<DeviceId, Instant> = HashMap::new();
    let mut last_sweep = Instant::now();
    let mut buf = vec![0u8; MAX_BEACON];

    loop {
        match tokio::time::timeout(interval, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..len]) else {
                    continue;
                };
                if beacon.service != SERVICE_TYPE || beacon.device.device_id() == own_id {
                    continue;
                }
                let id = beacon.device.device_id().to_string();
                if seen.insert(id, Instant::now()).is_none() {
                    let addr = SocketAddr::new(from.ip(), beacon.device.port);
                    tracing::info!(peer = %beacon.device.device_id(), %addr, "discovered peer");
                    let found = DiscoveryEvent::Found {
                        device: beacon.device,
                        addr,
                    };
                    if tx.send(found).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Err(err)) => tracing::debug!(error = %err, "discovery receive failed"),
            Err(_) => {}
        }

        if last_sweep.elapsed() < interval {
            continue;
        }
        last_sweep = Instant::now();
        let expired: Vec<DeviceId> = seen
            .iter()
            .filter(|(_, last)| last.elapsed() > peer_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for device_id in expired {
            seen.remove(&device_id);
            tracing::info!(peer = %device_id, "peer went away");
            if tx.send(DiscoveryEvent::Lost { device_id }).await.is_err() {
                return;
            }
        }
    }
}

/// A fixed peer list, for configured peers and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<(PeerDevice, SocketAddr)>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<(PeerDevice, SocketAddr)>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn start(&self, _local: PeerDevice) -> Result<mpsc::Receiver<DiscoveryEvent>, PeerError> {
        let (tx, rx) = mpsc::channel(self.peers.len().max(1));
        for (device, addr) in &self.peers {
            // capacity covers every peer
            let _ = tx.try_send(DiscoveryEvent::Found {
                device: device.clone(),
                addr: *addr,
            });
        }
        Ok(rx)
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;

    fn device(id: &str, port: u16) -> PeerDevice {
        PeerDevice {
            identity: DeviceIdentity::new(id, "Laptop"),
            port,
        }
    }

    #[test]
    fn beacon_wire_shape() {
        let json = serde_json::to_value(Beacon::new(device("a", 47600))).unwrap();
        assert_eq!(json["service"], SERVICE_TYPE);
        assert_eq!(json["device"]["deviceId"], "a");
        assert_eq!(json["device"]["port"], 47600);
    }

    #[tokio::test]
    async fn static_discovery_reports_all_peers() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let discovery = StaticDiscovery::new(vec![(device("b", 4000), addr)]);
        let mut rx = discovery.start(device("a", 0)).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(DiscoveryEvent::Found {
                device: device("b", 4000),
                addr
            })
        );
        assert_eq!(rx.recv().await, None);
    }
}
