//! Drives push/pull cycles against one [`SyncProvider`].

use super::SyncStatus;
use crate::config::ReplicaConfig;
use crate::identity::{DeviceIdentity, Identity};
use crate::now_millis;
use crate::provider::{DeviceInfo, SyncError, SyncProvider, SyncResult};
use crate::repository::{ReplicaRepository, SyncReport};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use shelf_engine::{EventId, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Batch and page sizes for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub push_batch_size: usize,
    pub pull_limit: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            push_batch_size: 100,
            pull_limit: 500,
        }
    }
}

impl From<&ReplicaConfig> for OrchestratorSettings {
    fn from(config: &ReplicaConfig) -> Self {
        Self {
            push_batch_size: config.sync_batch_size,
            pull_limit: config.pull_limit,
        }
    }
}

/// What one completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub pushed: usize,
    pub push_failures: usize,
    pub push_conflicts: usize,
    pub pulled: SyncReport,
    pub server_timestamp: Timestamp,
}

pub struct CloudSyncOrchestrator {
    repository: Arc<ReplicaRepository>,
    provider: Arc<dyn SyncProvider>,
    identity: Identity,
    device: DeviceIdentity,
    settings: OrchestratorSettings,
    status: watch::Sender<SyncStatus>,
    in_flight: Mutex<()>,
}

impl CloudSyncOrchestrator {
    pub fn new(
        repository: Arc<ReplicaRepository>,
        provider: Arc<dyn SyncProvider>,
        identity: Identity,
        device: DeviceIdentity,
        settings: OrchestratorSettings,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            repository,
            provider,
            identity,
            device,
            settings,
            status,
            in_flight: Mutex::new(()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Local events not yet pushed for the current identity.
    pub async fn pending_count(&self) -> crate::Result<u64> {
        match self.identity.current() {
            Some(identity) => self.repository.sync_state().pending_count(&identity).await,
            None => Ok(0),
        }
    }

    /// Run one full cycle now.
    ///
    /// Returns `Ok(None)` without doing anything when signed out or when a
    /// cycle is already running. Failures leave the committed part of the
    /// cycle in place and move the status to error.
    pub async fn sync_now(&self) -> SyncResult<Option<SyncSummary>> {
        let Some(identity) = self.identity.current() else {
            tracing::debug!("no identity, skipping cloud sync");
            return Ok(None);
        };
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("cloud sync already running");
            return Ok(None);
        };

        self.status.send_replace(SyncStatus::Syncing);
        match self.run_cycle(&identity).await {
            Ok(summary) => {
                tracing::info!(
                    provider = self.provider.name(),
                    pushed = summary.pushed,
                    pulled = summary.pulled.applied,
                    conflicts = summary.push_conflicts + summary.pulled.conflicts.len(),
                    server_timestamp = summary.server_timestamp,
                    "cloud sync finished"
                );
                self.status.send_replace(SyncStatus::Synced {
                    server_timestamp: summary.server_timestamp,
                    at: Utc::now(),
                });
                Ok(Some(summary))
            }
            Err(err) => {
                tracing::warn!(provider = self.provider.name(), error = %err, "cloud sync failed");
                self.status.send_replace(SyncStatus::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_cycle(&self, identity: &str) -> SyncResult<SyncSummary> {
        if !self.provider.is_connected() {
            self.provider.connect().await?;
            self.provider
                .register_device(&DeviceInfo {
                    device_id: self.device.device_id.clone(),
                    name: self.device.name.clone(),
                    platform: self.device.platform.clone(),
                    last_seen: now_millis(),
                })
                .await?;
        }

        let mut summary = SyncSummary::default();
        self.push_pending(identity, &mut summary).await?;
        self.pull_remote(identity, &mut summary).await?;
        Ok(summary)
    }

    async fn push_pending(&self, identity: &str, summary: &mut SyncSummary) -> SyncResult<()> {
        let sync_state = self.repository.sync_state();
        loop {
            let batch = sync_state
                .pending_events(identity, self.settings.push_batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            let result = self.provider.push_events(&batch).await?;
            sync_state.mark_synced(identity, &result.accepted).await?;
            summary.pushed += result.success_count;
            summary.push_failures += result.failure_count;
            summary.server_timestamp = summary.server_timestamp.max(result.server_timestamp);

            if !result.conflicts.is_empty() {
                let winners = self.provider.resolve_conflicts(&result.conflicts).await?;
                let report = self.repository.sync_events(&winners).await?;
                let settled: Vec<EventId> =
                    result.conflicts.iter().map(|c| c.local.event_id).collect();
                sync_state.mark_synced(identity, &settled).await?;
                summary.push_conflicts += result.conflicts.len();
                tracing::debug!(
                    conflicts = settled.len(),
                    remote_wins = report.conflicts.len(),
                    "settled push conflicts"
                );
            }

            // rejected events stay pending and are retried next cycle
            if result.accepted.is_empty() && result.conflicts.is_empty() {
                return Ok(());
            }
        }
    }

    async fn pull_remote(&self, identity: &str, summary: &mut SyncSummary) -> SyncResult<()> {
        let sync_state = self.repository.sync_state();
        let mut since = sync_state.cursor(identity).await?;
        loop {
            let page = self
                .provider
                .pull_events(since, self.settings.pull_limit)
                .await?;

            let report = self.repository.sync_events(&page.events).await?;
            let ids: Vec<EventId> = page.events.iter().map(|e| e.event_id).collect();
            sync_state.mark_synced(identity, &ids).await?;
            sync_state.advance_cursor(identity, page.server_timestamp).await?;
            summary.pulled.merge(report);
            summary.server_timestamp = summary.server_timestamp.max(page.server_timestamp);

            if !page.has_more || page.server_timestamp <= since {
                return Ok(());
            }
            since = page.server_timestamp;
        }
    }

    /// Sync on a timer until the task is aborted.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // errors are already reflected in the status
                let _ = self.sync_now().await;
            }
        })
    }

    /// Fold events from the provider's live feed as they arrive. The task
    /// ends when the feed does; periodic sync picks up from there.
    pub fn spawn_live_updates(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.follow_updates().await {
                tracing::warn!(error = %err, "live updates stopped");
            }
        })
    }

    async fn follow_updates(&self) -> SyncResult<()> {
        let identity = self.identity.current().ok_or(SyncError::AuthenticationRequired)?;
        if !self.provider.is_connected() {
            self.provider.connect().await?;
        }
        let mut updates = self.provider.subscribe_to_updates().await?;
        while let Some(update) = updates.next().await {
            let event = update?;
            if event.device_id == self.device.device_id {
                continue;
            }
            self.repository.sync_events(std::slice::from_ref(&event)).await?;
            self.repository
                .sync_state()
                .mark_synced(&identity, &[event.event_id])
                .await?;
        }
        Ok(())
    }
}
