//! SQLite persistence: the event log and sync metadata.

mod events;
mod pool;
mod sync_state;

pub use events::*;
pub use pool::*;
pub use sync_state::*;

/// Connect, migrate and hand out both stores over one pool.
pub async fn open(database_url: &str) -> crate::Result<(EventStore, SyncState)> {
    let pool = if database_url == "sqlite::memory:" {
        create_memory_pool().await?
    } else {
        create_pool(database_url).await?
    };
    run_migrations(&pool).await?;
    Ok((EventStore::new(pool.clone()), SyncState::new(pool)))
}
