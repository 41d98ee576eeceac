//! Request handlers, shared by the HTTP routes and the WebSocket session.

mod devices;
mod pull;
mod push;
mod resolve;
mod websocket;

pub use devices::*;
pub use pull::*;
pub use push::*;
pub use resolve::*;
pub use websocket::handle_websocket_connection;
