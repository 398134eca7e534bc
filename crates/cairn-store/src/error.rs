//! Error types for the store.

use thiserror::Error;

/// Errors that can occur in store operations.
///
/// Programmer errors (nested units of work, invalid identities, reads of
/// documents that vanished from the cache) are assertions and panic instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An id was assigned that is already bound to another live identity,
    /// and both identities are materialized into distinct records.
    #[error("duplicate id {resource_type}:{id} for {lid} (already bound to {existing_lid})")]
    DuplicateId {
        resource_type: String,
        id: String,
        lid: String,
        existing_lid: String,
    },

    /// The store (or one of its components) has been destroyed.
    #[error("store has been destroyed")]
    Destroyed,

    /// Invalid store configuration.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// The configured cache does not support this operation.
    #[error("cache does not support {0}")]
    Unsupported(&'static str),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
