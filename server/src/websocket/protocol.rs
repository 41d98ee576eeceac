//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names.

use serde::{Deserialize, Serialize};
use shelf_engine::{Conflict, DomainEvent};
use uuid::Uuid;

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request events after a server timestamp.
    Pull {
        /// Server timestamp from the previous pull (null for initial sync)
        #[serde(default)]
        since: Option<u64>,
        #[serde(default)]
        limit: Option<i64>,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Push events to the server.
    Push {
        events: Vec<DomainEvent>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response to a pull request.
    PullResponse {
        events: Vec<DomainEvent>,
        has_more: bool,
        server_timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to a push request.
    PushResponse {
        accepted: Vec<Uuid>,
        conflicts: Vec<Conflict>,
        server_timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// New events recorded by another connection of the same identity.
    EventsAvailable {
        events: Vec<DomainEvent>,
        server_timestamp: u64,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Create an events_available notification.
    pub fn events_available(events: Vec<DomainEvent>, server_timestamp: u64) -> Self {
        ServerMessage::EventsAvailable {
            events,
            server_timestamp,
        }
    }
}
