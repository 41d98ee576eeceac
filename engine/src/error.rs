//! Error types for the Shelf engine.

use crate::{AggregateId, AggregateType};
use thiserror::Error;

/// All possible errors from the Shelf engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// Natural-key collision, e.g. an ISBN that is already mapped.
    #[error("aggregate already exists: {0}")]
    AggregateAlreadyExists(String),

    #[error("aggregate {id} has type {actual}, expected {expected}")]
    AggregateTypeMismatch {
        id: AggregateId,
        expected: AggregateType,
        actual: AggregateType,
    },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
