//! Who this device is, and who is signed in.

use crate::db::SyncState;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use shelf_engine::DeviceId;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

const DEVICE_ID_KEY: &str = "device_id";

/// Current account identity, or none when signed out.
///
/// Cloud sync is disabled while no identity is set. Clones share state.
#[derive(Debug, Clone)]
pub struct Identity {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Identity {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn set(&self, identity: impl Into<String>) {
        self.tx.send_replace(Some(identity.into()));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Notified on sign-in and sign-out.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

/// The stable device id, generated and stored on first open.
pub async fn load_or_create_device_id(sync_state: &SyncState) -> Result<DeviceId> {
    if let Some(id) = sync_state.device_value(DEVICE_ID_KEY).await? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    sync_state.set_device_value(DEVICE_ID_KEY, &id).await?;
    tracing::info!(device_id = %id, "generated device id");
    Ok(id)
}

/// What a device advertises about itself to peers and the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}
