//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections per identity so that events recorded
//! for an account reach that account's other connections, and no one else.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    /// Account the connection authenticated as
    pub identity: String,
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs per identity.
    by_identity: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, identity: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                identity: identity.clone(),
                sender,
            },
        );
        self.by_identity
            .entry(identity)
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_identity.get_mut(&conn.identity) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_identity.remove(&conn.identity);
                }
            }

            tracing::info!(conn_id = %conn_id, identity = %conn.identity, "WebSocket connection unregistered");
        }
    }

    /// Send a message to every connection of `identity` except `except`.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast(&self, identity: &str, except: Option<&str>, message: &ServerMessage) -> usize {
        let Some(conn_ids) = self.by_identity.get(identity).map(|ids| ids.clone()) else {
            return 0;
        };

        let mut sent_count = 0;
        for conn_id in conn_ids.iter().filter(|id| Some(id.as_str()) != except) {
            if let Some(conn) = self.connections.get(conn_id) {
                if conn.sender.send(message.clone()).is_ok() {
                    sent_count += 1;
                }
            }
        }

        tracing::debug!(
            identity = %identity,
            recipients = sent_count,
            "Broadcast message to connections"
        );

        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of identities with at least one open connection.
    pub fn identity_count(&self) -> usize {
        self.by_identity.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register("alice".to_string(), tx);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.identity_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.identity_count(), 0);
    }

    #[test]
    fn test_broadcast_stays_within_identity() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();

        let conn1 = manager.register("alice".to_string(), tx1);
        let _conn2 = manager.register("alice".to_string(), tx2);
        let _conn3 = manager.register("bob".to_string(), tx3);

        let sent = manager.broadcast("alice", Some(&conn1), &ServerMessage::Pong);
        assert_eq!(sent, 1);

        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), ServerMessage::Pong));
        assert!(rx3.try_recv().is_err());

        assert_eq!(manager.broadcast("alice", None, &ServerMessage::Pong), 2);
        assert_eq!(manager.broadcast("carol", None, &ServerMessage::Pong), 0);
    }

    #[test]
    fn test_send_to() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = manager.register("alice".to_string(), tx);

        assert!(manager.send_to(&conn, ServerMessage::Pong));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Pong));
        assert!(!manager.send_to("missing", ServerMessage::Pong));
    }
}
