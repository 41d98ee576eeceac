//! Remote event exchange.
//!
//! The cloud orchestrator only talks to a [`SyncProvider`]; concrete
//! transports live in the submodules.

mod http;
mod memory;

pub use http::HttpSyncProvider;
pub use memory::{MemoryBackend, MemorySyncProvider};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use shelf_engine::{Conflict, DeviceId, DomainEvent, EventId, Timestamp};

/// Errors raised by sync transports.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not connected to the sync backend")]
    NotConnected,

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("conflict resolution failed: {0}")]
    ConflictResolutionFailed(String),

    #[error("local replica error: {0}")]
    Replica(#[from] crate::Error),

    #[error("unknown sync error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Outcome of pushing one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub success_count: usize,
    pub failure_count: usize,
    /// Ids the backend now holds, including ones it already had
    pub accepted: Vec<EventId>,
    /// Pushed events whose id the backend holds with other content; `local`
    /// is the pushed copy, `remote` the backend's
    pub conflicts: Vec<Conflict>,
    pub server_timestamp: Timestamp,
}

/// One page of remote events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub events: Vec<DomainEvent>,
    pub has_more: bool,
    /// Cursor to pass as `since` for the next page
    pub server_timestamp: Timestamp,
}

/// A device registered with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: String,
    pub last_seen: Timestamp,
}

/// Capability interface over a remote event exchange.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    async fn connect(&self) -> SyncResult<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Round trip to the backend without side effects.
    async fn test_connection(&self) -> SyncResult<()>;

    async fn push_events(&self, events: &[DomainEvent]) -> SyncResult<PushResult>;

    /// Events recorded after the `since` cursor, at most `limit`.
    async fn pull_events(&self, since: Timestamp, limit: usize) -> SyncResult<PullResult>;

    async fn get_latest_timestamp(&self) -> SyncResult<Timestamp>;

    /// Live feed of events pushed by other devices. Ends after yielding an
    /// error.
    async fn subscribe_to_updates(&self)
        -> SyncResult<BoxStream<'static, SyncResult<DomainEvent>>>;

    /// Let the backend settle push conflicts. Returns the winning events.
    async fn resolve_conflicts(&self, conflicts: &[Conflict]) -> SyncResult<Vec<DomainEvent>>;

    async fn register_device(&self, device: &DeviceInfo) -> SyncResult<()>;

    async fn get_connected_devices(&self) -> SyncResult<Vec<DeviceInfo>>;
}
