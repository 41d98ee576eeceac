//! Wire format between peers: a 4-byte big-endian length, then one JSON
//! encoded [`PeerMessage`].

use super::PeerError;
use crate::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};
use shelf_engine::{DomainEvent, VectorClock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Service name carried in discovery beacons.
pub const SERVICE_TYPE: &str = "_shelf-sync._tcp";

/// Largest frame accepted from a peer.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Encoded size one `Events` frame is filled up to.
pub const BATCH_BYTES: usize = 4 * 1024 * 1024;

/// A device reachable for peer sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDevice {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    /// TCP port of the peer listener
    pub port: u16,
}

impl PeerDevice {
    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Opens a session in both directions.
    Hello {
        device: DeviceIdentity,
        frontier: VectorClock,
    },
    /// Ask for every event not covered by `frontier`.
    EventsRequest { frontier: VectorClock },
    /// One batch of a delta. `more` is set on every batch but the last.
    Events {
        events: Vec<DomainEvent>,
        #[serde(default)]
        more: bool,
    },
    /// Confirms a received `Events` message was folded.
    Ack { received: usize },
    Error { message: String },
}

impl PeerMessage {
    fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::EventsRequest { .. } => "events_request",
            PeerMessage::Events { .. } => "events",
            PeerMessage::Ack { .. } => "ack",
            PeerMessage::Error { .. } => "error",
        }
    }

    /// Error for receiving this message when `expected` was due. A remote
    /// `Error` message is passed through.
    pub fn unexpected(&self, expected: &str) -> PeerError {
        match self {
            PeerMessage::Error { message } => PeerError::Protocol(format!("peer reported: {message}")),
            other => PeerError::Protocol(format!("expected {expected}, got {}", other.kind())),
        }
    }
}

/// Split a delta into batches whose encoded size stays within `max_bytes`.
///
/// An event larger than the budget travels alone. There is always at least
/// one batch, so an empty delta still ends the exchange.
pub fn batches(
    events: Vec<DomainEvent>,
    max_bytes: usize,
) -> Result<Vec<Vec<DomainEvent>>, PeerError> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    // array brackets
    let mut size = 2;
    for event in events {
        // separator included
        let len = serde_json::to_vec(&event)?.len() + 1;
        if !current.is_empty() && size + len > max_bytes {
            batches.push(std::mem::take(&mut current));
            size = 2;
        }
        size += len;
        current.push(event);
    }
    if !current.is_empty() || batches.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

pub async fn write_frame<W>(writer: &mut W, message: &PeerMessage) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME {
        return Err(PeerError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<PeerMessage, PeerError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(PeerError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
