//! Crate-wide error taxonomy
//!
//! Each public-facing boundary gets its own `thiserror` enum rather than a
//! single crate-wide error type, so callers can match on the failure modes
//! relevant to the call they made instead of a catch-all.

use uuid::Uuid;

/// Errors raised by [`crate::registry::Registry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A different body is already registered under this name.
    #[error("registration conflict: {0} is already registered with a different body")]
    Conflict(String),

    /// Lookup by name found nothing.
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),
}

/// Errors raised by [`crate::dispatcher::Dispatcher`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to serialize arguments: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

/// Errors raised by a [`crate::backend::Backend`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("lease lost for task {0}: no longer held by this worker")]
    LeaseLost(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the worker loop while driving a single task.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("task body timed out")]
    Timeout,

    #[error("worker is shutting down")]
    Shutdown,
}
