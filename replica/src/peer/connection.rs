//! One sync session over an established stream.
//!
//! The initiator pushes first, then pulls. A delta travels as a run of
//! `Events` batches, each acknowledged before the next is sent:
//!
//! ```text
//! initiator                      responder
//!   Hello{frontier}       ->
//!                         <-     Hello{frontier}
//!   Events{batch, more}   ->
//!                         <-     Ack
//!   ...                                          (until more = false)
//!   EventsRequest{frontier} ->
//!                         <-     Events{batch, more}
//!   Ack                   ->
//!   ...
//! ```
//!
//! Acknowledged batches are marked as sent to the peer right away, so an
//! interrupted session resumes after the last acknowledged batch.

use super::protocol::{batches, read_frame, write_frame, PeerMessage, BATCH_BYTES};
use super::PeerError;
use crate::identity::DeviceIdentity;
use crate::repository::{ReplicaRepository, SyncReport};
use shelf_engine::{DomainEvent, EventId, VectorClock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// What a finished session exchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub peer: DeviceIdentity,
    pub sent: usize,
    pub received: SyncReport,
}

pub struct PeerConnection<'a, S> {
    stream: S,
    repository: &'a ReplicaRepository,
    local: &'a DeviceIdentity,
    timeout: Duration,
    batch_bytes: usize,
}

impl<'a, S> PeerConnection<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        repository: &'a ReplicaRepository,
        local: &'a DeviceIdentity,
        timeout: Duration,
    ) -> Self {
        Self {
            stream,
            repository,
            local,
            timeout,
            batch_bytes: BATCH_BYTES,
        }
    }

    /// Override the encoded size each `Events` batch is filled up to.
    pub fn with_batch_bytes(mut self, batch_bytes: usize) -> Self {
        self.batch_bytes = batch_bytes;
        self
    }

    async fn send(&mut self, message: &PeerMessage) -> Result<(), PeerError> {
        tokio::time::timeout(self.timeout, write_frame(&mut self.stream, message))
            .await
            .map_err(|_| PeerError::Timeout)?
    }

    async fn recv(&mut self) -> Result<PeerMessage, PeerError> {
        tokio::time::timeout(self.timeout, read_frame(&mut self.stream))
            .await
            .map_err(|_| PeerError::Timeout)?
    }

    async fn hello(&self) -> PeerMessage {
        PeerMessage::Hello {
            device: self.local.clone(),
            frontier: self.repository.frontier().await,
        }
    }

    /// Events the peer has neither folded nor been sent before.
    async fn delta_for(
        &self,
        peer: &DeviceIdentity,
        frontier: &VectorClock,
    ) -> Result<Vec<DomainEvent>, PeerError> {
        let already_sent = self
            .repository
            .sync_state()
            .peer_synced_ids(&peer.device_id)
            .await?;
        let missing = self.repository.events_missing_from(frontier).await?;
        Ok(missing
            .into_iter()
            .filter(|event| !already_sent.contains(&event.event_id))
            .collect())
    }

    async fn mark_sent(&self, peer: &DeviceIdentity, ids: &[EventId]) -> Result<(), PeerError> {
        self.repository
            .sync_state()
            .mark_peer_synced(&peer.device_id, ids)
            .await?;
        Ok(())
    }

    /// Send `outgoing` batch by batch. Returns how many events the peer
    /// acknowledged.
    async fn send_delta(
        &mut self,
        peer: &DeviceIdentity,
        outgoing: Vec<DomainEvent>,
    ) -> Result<usize, PeerError> {
        let batches = batches(outgoing, self.batch_bytes)?;
        let total = batches.len();
        let mut sent = 0;
        for (n, events) in batches.into_iter().enumerate() {
            let ids: Vec<EventId> = events.iter().map(|e| e.event_id).collect();
            self.send(&PeerMessage::Events {
                events,
                more: n + 1 < total,
            })
            .await?;
            match self.recv().await? {
                PeerMessage::Ack { .. } => self.mark_sent(peer, &ids).await?,
                other => return Err(other.unexpected("ack")),
            }
            sent += ids.len();
        }
        Ok(sent)
    }

    /// Fold and acknowledge batches until the last one arrives.
    async fn receive_delta(&mut self) -> Result<SyncReport, PeerError> {
        let mut report = SyncReport::default();
        loop {
            let (events, more) = match self.recv().await? {
                PeerMessage::Events { events, more } => (events, more),
                other => return Err(other.unexpected("events")),
            };
            report.merge(self.repository.sync_events(&events).await?);
            self.send(&PeerMessage::Ack {
                received: events.len(),
            })
            .await?;
            if !more {
                return Ok(report);
            }
        }
    }

    /// Run the session as the side that connected.
    pub async fn initiate(mut self) -> Result<SessionOutcome, PeerError> {
        let hello = self.hello().await;
        self.send(&hello).await?;
        let (peer, their_frontier) = match self.recv().await? {
            PeerMessage::Hello { device, frontier } => (device, frontier),
            other => return Err(other.unexpected("hello")),
        };

        let outgoing = self.delta_for(&peer, &their_frontier).await?;
        let sent = self.send_delta(&peer, outgoing).await?;

        let frontier = self.repository.frontier().await;
        self.send(&PeerMessage::EventsRequest { frontier }).await?;
        let received = self.receive_delta().await?;

        tracing::debug!(
            peer = %peer.device_id,
            sent,
            applied = received.applied,
            "peer session finished"
        );
        Ok(SessionOutcome {
            peer,
            sent,
            received,
        })
    }

    /// Run the session as the side that accepted.
    pub async fn respond(mut self) -> Result<SessionOutcome, PeerError> {
        let peer = match self.recv().await? {
            PeerMessage::Hello { device, .. } => device,
            other => {
                let err = other.unexpected("hello");
                let _ = self
                    .send(&PeerMessage::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };
        let hello = self.hello().await;
        self.send(&hello).await?;

        let received = self.receive_delta().await?;

        let outgoing = match self.recv().await? {
            PeerMessage::EventsRequest { frontier } => self.delta_for(&peer, &frontier).await?,
            other => return Err(other.unexpected("events_request")),
        };
        let sent = self.send_delta(&peer, outgoing).await?;

        tracing::debug!(
            peer = %peer.device_id,
            sent,
            applied = received.applied,
            "answered peer session"
        );
        Ok(SessionOutcome {
            peer,
            sent,
            received,
        })
    }
}
