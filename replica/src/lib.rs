//! # Shelf Replica
//!
//! Device-side runtime for the Shelf inventory: the durable event log, the
//! replica repository that folds it into materialized state, and the two
//! ways events travel between devices.
//!
//! - [`db`] - SQLite event store and sync bookkeeping
//! - [`repository`] - single-writer repository over [`shelf_engine::ReplicaState`]
//! - [`provider`] - the [`SyncProvider`] transport trait, in-memory and HTTP
//! - [`sync`] - the cloud sync orchestrator
//! - [`peer`] - direct device-to-device sync on the local network
//!
//! Components are built once by the caller and passed around as `Arc`s.
//!
//! ```rust,no_run
//! use shelf_replica::{db, identity, ReplicaRepository};
//! use shelf_engine::ItemSnapshot;
//!
//! # async fn run() -> shelf_replica::Result<()> {
//! let (store, sync_state) = db::open("sqlite://shelf.db").await?;
//! let device_id = identity::load_or_create_device_id(&sync_state).await?;
//! let repo = ReplicaRepository::open(store, sync_state, device_id).await?;
//!
//! let id = repo.create_item(ItemSnapshot::titled("Dune")).await?;
//! assert_eq!(repo.item(id).await.map(|i| i.title), Some("Dune".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod peer;
pub mod provider;
pub mod repository;
pub mod sync;

pub use config::{ConfigError, ReplicaConfig};
pub use error::{Error, Result};
pub use identity::{DeviceIdentity, Identity};
pub use peer::{PeerError, PeerSyncEngine};
pub use provider::{SyncError, SyncProvider};
pub use repository::{ReplicaRepository, SyncReport};
pub use sync::{CloudSyncOrchestrator, SyncStatus};

use shelf_engine::Timestamp;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
