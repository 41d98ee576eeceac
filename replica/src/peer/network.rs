//! Restarting discovery when the device's network changes.

use super::{PeerError, PeerSyncEngine};
use futures::{Stream, StreamExt};
use if_watch::{IfEvent, IpNet};
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long the interface list has to stay quiet before acting on it.
pub const SETTLE: Duration = Duration::from_millis(500);

/// Watch the host's interfaces and restart peer discovery whenever the set
/// of LAN addresses changes.
pub fn spawn_network_watcher(engine: Arc<PeerSyncEngine>) -> Result<JoinHandle<()>, PeerError> {
    let watcher = if_watch::tokio::IfWatcher::new()?;
    Ok(tokio::spawn(restart_on_network_change(engine, watcher, SETTLE)))
}

/// Drive `changes` and call [`PeerSyncEngine::restart`] once per settled
/// burst of address changes.
///
/// The first burst lists the addresses present when watching began and is
/// taken as the baseline.
pub async fn restart_on_network_change<S>(
    engine: Arc<PeerSyncEngine>,
    mut changes: S,
    settle: Duration,
) where
    S: Stream<Item = io::Result<IfEvent>> + Unpin,
{
    let mut addrs = HashSet::new();
    if !settle_changes(&mut changes, &mut addrs, settle).await {
        return;
    }
    tracing::debug!(addresses = addrs.len(), "watching network interfaces");

    loop {
        let changed = match changes.next().await {
            Some(Ok(event)) => apply(&mut addrs, event),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "network watcher failed");
                return;
            }
            None => return,
        };
        if !changed {
            continue;
        }
        let open = settle_changes(&mut changes, &mut addrs, settle).await;

        tracing::info!(addresses = addrs.len(), "network changed, restarting peer discovery");
        if let Err(err) = engine.restart().await {
            tracing::warn!(error = %err, "peer discovery restart failed");
        }
        if !open {
            return;
        }
    }
}

/// Fold events until none arrives for `settle`. Returns false once the
/// stream has ended or failed.
async fn settle_changes<S>(
    changes: &mut S,
    addrs: &mut HashSet<IpAddr>,
    settle: Duration,
) -> bool
where
    S: Stream<Item = io::Result<IfEvent>> + Unpin,
{
    loop {
        match tokio::time::timeout(settle, changes.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(event))) => {
                apply(addrs, event);
            }
            Ok(Some(Err(err))) => {
                tracing::warn!(error = %err, "network watcher failed");
                return false;
            }
            Ok(None) => return false,
        }
    }
}

/// Record one interface event. Returns whether the address set changed.
fn apply(addrs: &mut HashSet<IpAddr>, event: IfEvent) -> bool {
    match event {
        IfEvent::Up(net) => lan_addr(&net).is_some_and(|ip| addrs.insert(ip)),
        IfEvent::Down(net) => lan_addr(&net).is_some_and(|ip| addrs.remove(&ip)),
    }
}

/// Discovery beacons are IPv4 broadcasts, so only non-loopback IPv4
/// addresses matter.
fn lan_addr(net: &IpNet) -> Option<IpAddr> {
    match net.addr() {
        ip @ IpAddr::V4(v4) if !v4.is_loopback() => Some(ip),
        _ => None,
    }
}
