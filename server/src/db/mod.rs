//! Database module for PostgreSQL persistence.

mod devices;
mod events;
mod pool;

pub use devices::*;
pub use events::*;
pub use pool::*;
