//! Error types for the replica runtime.

use crate::config::ConfigError;
use shelf_engine::AggregateId;

/// Errors from the event store and the replica repository.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// Natural-key collision, e.g. an ISBN that is already mapped.
    #[error("aggregate already exists: {0}")]
    AggregateAlreadyExists(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] shelf_engine::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// A stored row that no longer decodes.
    pub(crate) fn corrupt(what: impl std::fmt::Display) -> Self {
        Error::Engine(shelf_engine::Error::Serialization(what.to_string()))
    }
}

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, Error>;
