use std::sync::Arc;

use storage::repository::Storage;

use crate::Clock;
use crate::error::AppServicesError;
use crate::runs::{RunLifecycleService, SessionDirectory};

/// Assembles app-facing services over a storage backend.
///
/// The session directory stays a constructor argument: which sessions exist
/// and who may use them is the embedding application's business.
#[derive(Clone)]
pub struct AppServices {
    run_lifecycle: Arc<RunLifecycleService>,
}

impl AppServices {
    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        sessions: Arc<dyn SessionDirectory>,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(clock, sessions, &storage))
    }

    /// Build services over in-memory storage, for tests and prototyping.
    #[must_use]
    pub fn in_memory(clock: Clock, sessions: Arc<dyn SessionDirectory>) -> Self {
        Self::from_storage(clock, sessions, &Storage::in_memory())
    }

    fn from_storage(clock: Clock, sessions: Arc<dyn SessionDirectory>, storage: &Storage) -> Self {
        let run_lifecycle = Arc::new(RunLifecycleService::new(
            clock,
            sessions,
            Arc::clone(&storage.runs),
            Arc::clone(&storage.checkins),
            Arc::clone(&storage.activities),
        ));
        Self { run_lifecycle }
    }

    #[must_use]
    pub fn run_lifecycle(&self) -> Arc<RunLifecycleService> {
        Arc::clone(&self.run_lifecycle)
    }
}
