//! WebSocket support for real-time sync.
//!
//! Clients connect via WebSocket, pull and push over the same socket, and
//! receive `events_available` notifications when another connection of the
//! same identity records new events.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
