//! Cloud synchronization.

mod orchestrator;

pub use orchestrator::{CloudSyncOrchestrator, OrchestratorSettings, SyncSummary};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelf_engine::Timestamp;

/// Observable state of the cloud sync loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    #[serde(rename_all = "camelCase")]
    Synced {
        server_timestamp: Timestamp,
        at: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl SyncStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SyncStatus::Error { .. })
    }
}
