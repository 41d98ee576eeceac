//! Headless Shelf replica node.
//!
//! Opens the local store, replays it, then keeps it in sync with the cloud
//! backend (when configured) and with peers on the local network until
//! interrupted.

use shelf_replica::peer::{spawn_network_watcher, PeerSettings, UdpDiscovery};
use shelf_replica::provider::HttpSyncProvider;
use shelf_replica::sync::OrchestratorSettings;
use shelf_replica::{
    db, identity, CloudSyncOrchestrator, DeviceIdentity, Identity, PeerSyncEngine, ReplicaConfig,
    ReplicaRepository,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelf_replica=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = ReplicaConfig::from_env()?;

    let (store, sync_state) = db::open(&config.database_url).await?;
    let device_id = identity::load_or_create_device_id(&sync_state).await?;
    let device = DeviceIdentity::new(device_id.clone(), config.device_name.clone());
    tracing::info!(
        device_id = %device_id,
        name = %device.name,
        database = %config.database_url,
        "starting shelf replica"
    );

    let repository = Arc::new(ReplicaRepository::open(store, sync_state, device_id).await?);
    let identity = Identity::new(config.auth_token.clone());
    let mut background = Vec::new();

    let orchestrator = match &config.sync_url {
        Some(url) => {
            let provider = HttpSyncProvider::new(url.clone(), identity.clone(), config.request_timeout)?;
            let orchestrator = Arc::new(CloudSyncOrchestrator::new(
                repository.clone(),
                Arc::new(provider),
                identity.clone(),
                device.clone(),
                OrchestratorSettings::from(&config),
            ));
            background.push(orchestrator.clone().spawn_periodic(config.sync_interval));
            if identity.current().is_some() {
                background.push(orchestrator.clone().spawn_live_updates());
            }
            tracing::info!(%url, interval = ?config.sync_interval, "cloud sync enabled");
            Some(orchestrator)
        }
        None => {
            tracing::info!("SHELF_SYNC_URL not set, cloud sync disabled");
            None
        }
    };

    let discovery = Arc::new(UdpDiscovery::new(config.discovery_port));
    let peers = Arc::new(PeerSyncEngine::new(
        repository.clone(),
        device,
        discovery,
        PeerSettings::from(&config),
    ));
    peers.start().await?;
    match spawn_network_watcher(peers.clone()) {
        Ok(task) => background.push(task),
        Err(err) => tracing::warn!(error = %err, "network changes will not restart discovery"),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    peers.stop().await;
    for task in background {
        task.abort();
    }
    if let Some(orchestrator) = orchestrator {
        // push whatever was written since the last cycle
        if let Err(err) = orchestrator.sync_now().await {
            tracing::warn!(error = %err, "final sync failed");
        }
    }
    Ok(())
}
