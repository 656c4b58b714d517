//! Shared error types for the services crate.

use thiserror::Error;

use runs_core::model::RunStatus;
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by `RunLifecycleService`.
///
/// The HTTP layer owns the mapping to status codes; this taxonomy only
/// keeps the cases distinct. `StorageError::Conflict` raced inside the
/// idempotent start is resolved by re-reading and never reaches a caller
/// through `start`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunServiceError {
    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("run belongs to another user")]
    Forbidden,

    #[error("run not found")]
    NotFound,

    #[error("session does not exist or is not accessible")]
    InvalidSession,

    #[error("illegal transition from a {from} run")]
    InvalidTransition { from: RunStatus },

    #[error("stale progress: step {supplied} is behind stored step {current}")]
    StaleProgress { current: u32, supplied: u32 },

    #[error("run is closed to further writes")]
    RunClosed,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}
