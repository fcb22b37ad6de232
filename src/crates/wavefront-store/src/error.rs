//! Error types for the storage layer.

use thiserror::Error;

/// Convenience result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by [`StateStore`](crate::StateStore) implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Requested run does not exist.
    #[error("run '{0}' not found")]
    RunNotFound(String),

    /// Requested suspension does not exist.
    #[error("suspension '{0}' not found")]
    SuspensionNotFound(String),

    /// Attempted to resolve a suspension that is no longer pending.
    #[error("suspension '{id}' is already {state}")]
    SuspensionNotPending {
        /// Suspension identifier.
        id: String,
        /// The state the suspension was found in (`resolved` or `cancelled`).
        state: String,
    },

    /// Attempted to mutate an entity owned by a run that reached a terminal status.
    #[error("run '{0}' has reached a terminal status and can no longer be mutated")]
    RunFinalized(String),

    /// A record failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (connection lost, constraint violation, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}
