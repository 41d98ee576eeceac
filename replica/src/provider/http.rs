//! HTTP transport speaking to `shelf-server`.

use super::{DeviceInfo, PullResult, PushResult, SyncError, SyncProvider, SyncResult};
use crate::identity::Identity;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shelf_engine::{Conflict, DomainEvent, Timestamp};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const POLL_PAGE: usize = 100;

#[derive(Serialize)]
struct PushRequest<'a> {
    events: &'a [DomainEvent],
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    conflicts: &'a [Conflict],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestResponse {
    server_timestamp: Timestamp,
}

#[derive(Deserialize)]
struct ResolveResponse {
    events: Vec<DomainEvent>,
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Serialization(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// Map a non-success response onto a [`SyncError`].
async fn check(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthenticationFailed,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYLOAD_TOO_LARGE => SyncError::QuotaExceeded,
        status => SyncError::Server {
            code: status.as_u16(),
            message,
        },
    })
}

/// A [`SyncProvider`] over the backend's HTTP API. The current identity is
/// sent as the bearer token.
#[derive(Debug)]
pub struct HttpSyncProvider {
    client: reqwest::Client,
    base_url: String,
    identity: Identity,
    connected: AtomicBool,
    poll_interval: Duration,
}

impl HttpSyncProvider {
    pub fn new(
        base_url: impl Into<String>,
        identity: Identity,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
            connected: AtomicBool::new(false),
            poll_interval: Duration::from_secs(5),
        })
    }

    /// How often the update subscription polls for new events.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn token(&self) -> SyncResult<String> {
        self.identity.current().ok_or(SyncError::AuthenticationRequired)
    }

    fn session(&self) -> SyncResult<String> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.token()
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, token: &str) -> SyncResult<T> {
        let response = check(request.bearer_auth(token).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn latest(&self, token: &str) -> SyncResult<Timestamp> {
        let latest: LatestResponse = self.send(self.client.get(self.url("/sync/latest")), token).await?;
        Ok(latest.server_timestamp)
    }
}

#[async_trait]
impl SyncProvider for HttpSyncProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn connect(&self) -> SyncResult<()> {
        let token = self.token()?;
        self.latest(&token).await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(url = %self.base_url, "connected to sync backend");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let token = self.session()?;
        self.latest(&token).await.map(|_| ())
    }

    async fn push_events(&self, events: &[DomainEvent]) -> SyncResult<PushResult> {
        let token = self.session()?;
        let request = self.client.post(self.url("/sync/push")).json(&PushRequest { events });
        self.send(request, &token).await
    }

    async fn pull_events(&self, since: Timestamp, limit: usize) -> SyncResult<PullResult> {
        let token = self.session()?;
        let request = self
            .client
            .get(self.url("/sync/pull"))
            .query(&[("since", since), ("limit", limit as u64)]);
        self.send(request, &token).await
    }

    async fn get_latest_timestamp(&self) -> SyncResult<Timestamp> {
        let token = self.session()?;
        self.latest(&token).await
    }

    /// Polls `/sync/pull` from the current latest timestamp onward.
    async fn subscribe_to_updates(
        &self,
    ) -> SyncResult<BoxStream<'static, SyncResult<DomainEvent>>> {
        let token = self.session()?;
        let cursor = self.latest(&token).await?;

        let client = self.client.clone();
        let url = self.url("/sync/pull");
        let interval = self.poll_interval;
        let initial = Some((cursor, VecDeque::<DomainEvent>::new()));

        let updates = stream::unfold(initial, move |state| {
            let (client, url, token) = (client.clone(), url.clone(), token.clone());
            async move {
                let (mut cursor, mut buffered) = state?;
                loop {
                    if let Some(event) = buffered.pop_front() {
                        return Some((Ok(event), Some((cursor, buffered))));
                    }
                    tokio::time::sleep(interval).await;
                    let request = client
                        .get(&url)
                        .query(&[("since", cursor), ("limit", POLL_PAGE as u64)])
                        .bearer_auth(&token);
                    let page = match request.send().await {
                        Ok(response) => match check(response).await {
                            Ok(response) => response.json::<PullResult>().await.map_err(SyncError::from),
                            Err(err) => Err(err),
                        },
                        Err(err) => Err(err.into()),
                    };
                    match page {
                        Ok(page) => {
                            cursor = page.server_timestamp.max(cursor);
                            buffered.extend(page.events);
                        }
                        Err(err) => return Some((Err(err), None)),
                    }
                }
            }
        });
        Ok(updates.boxed())
    }

    async fn resolve_conflicts(&self, conflicts: &[Conflict]) -> SyncResult<Vec<DomainEvent>> {
        let token = self.session()?;
        let request = self
            .client
            .post(self.url("/sync/resolve"))
            .json(&ResolveRequest { conflicts });
        let resolved: ResolveResponse = self.send(request, &token).await.map_err(|err| match err {
            SyncError::Server { code, message } => {
                SyncError::ConflictResolutionFailed(format!("{code}: {message}"))
            }
            other => other,
        })?;
        Ok(resolved.events)
    }

    async fn register_device(&self, device: &DeviceInfo) -> SyncResult<()> {
        let token = self.session()?;
        let request = self.client.post(self.url("/devices")).json(device);
        let response = request.bearer_auth(&token).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn get_connected_devices(&self) -> SyncResult<Vec<DeviceInfo>> {
        let token = self.session()?;
        self.send(self.client.get(self.url("/devices")), &token).await
    }
}
