//! Error types for the tabular store.
//!
//! The data-mutation API never raises for caller mistakes; these errors
//! surface only from the JSON convenience helpers and the persister
//! contract.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("persister error: {0}")]
    Persister(String),

    #[error("a load is already in flight")]
    LoadInFlight,

    #[error("a save is already in flight")]
    SaveInFlight,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
