use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use runs_core::model::{
    Activity, ActivityId, Checkin, CheckinId, RunError, RunId, RunStatus, SessionId, SessionRun,
    UserId,
};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Persisted shape for a freshly started run.
///
/// Runs are born `active` (the transient `pending` state collapses at
/// creation), so the record carries no status field.
#[derive(Debug, Clone)]
pub struct NewRunRecord {
    pub id: RunId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub current_step_index: u32,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

impl NewRunRecord {
    /// Record for a run starting now, at step zero with an empty payload.
    #[must_use]
    pub fn started(
        id: RunId,
        session_id: SessionId,
        user_id: UserId,
        started_at: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id,
            session_id,
            user_id,
            started_at,
            current_step_index: 0,
            payload: Value::Null,
            idempotency_key,
        }
    }

    /// Convert the record into the domain aggregate it will persist as.
    ///
    /// # Errors
    ///
    /// Returns `RunError` if the record fields cannot form a valid run.
    pub fn into_run(self) -> Result<SessionRun, RunError> {
        SessionRun::from_persisted(
            self.id,
            self.session_id,
            self.user_id,
            RunStatus::Active,
            self.started_at,
            self.started_at,
            None,
            None,
            self.current_step_index,
            self.payload,
            self.idempotency_key,
            None,
        )
    }
}

/// Optional constraints for `list_runs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub session_id: Option<SessionId>,
}

/// Repository contract for session runs.
///
/// The guarded mutations (`apply_progress`, `mark_completed`,
/// `mark_abandoned`) return `Ok(false)` when the guard did not match — the
/// run is missing, terminal, or the step index went backwards. Callers
/// classify the miss by re-reading; the store never applies a partial
/// write.
#[async_trait]
pub trait SessionRunRepository: Send + Sync {
    /// Insert a new run row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` when a run already holds the same
    /// (`session_id`, `idempotency_key`) pair, or other storage errors.
    async fn insert_run(&self, record: &NewRunRecord) -> Result<(), StorageError>;

    /// Fetch the run created under the given idempotency key, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn find_run_by_key(
        &self,
        session_id: SessionId,
        idempotency_key: &str,
    ) -> Result<Option<SessionRun>, StorageError>;

    /// Fetch a run by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn get_run(&self, id: RunId) -> Result<Option<SessionRun>, StorageError>;

    /// List runs owned by `user_id`, newest started first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn list_runs(
        &self,
        user_id: UserId,
        filter: &RunFilter,
    ) -> Result<Vec<SessionRun>, StorageError>;

    /// Write progress while the run is active, in one guarded statement.
    ///
    /// When `step_index` is supplied the guard also requires the stored
    /// index to be ≤ the new one, so an out-of-order write cannot land.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn apply_progress(
        &self,
        id: RunId,
        step_index: Option<u32>,
        payload: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Transition `active` → `completed` in one guarded statement.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn mark_completed(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Transition `active` → `abandoned` in one guarded statement.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn mark_abandoned(
        &self,
        id: RunId,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// Repository contract for run check-ins.
#[async_trait]
pub trait CheckinRepository: Send + Sync {
    /// Append a check-in while the run is active.
    ///
    /// Returns `Ok(None)` when the run is missing or terminal; the liveness
    /// check and the insert are a single statement.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn append_checkin(
        &self,
        run_id: RunId,
        body: &Value,
        at: DateTime<Utc>,
    ) -> Result<Option<CheckinId>, StorageError>;

    /// List check-ins for a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn list_checkins(&self, run_id: RunId) -> Result<Vec<Checkin>, StorageError>;
}

/// Repository contract for run activities.
#[async_trait]
pub trait ActivityRepository: Send + Sync {
    /// Append an activity while the run is active.
    ///
    /// Returns `Ok(None)` when the run is missing or terminal; the liveness
    /// check and the insert are a single statement.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn append_activity(
        &self,
        run_id: RunId,
        body: &Value,
        at: DateTime<Utc>,
    ) -> Result<Option<ActivityId>, StorageError>;

    /// List activities for a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on storage failures.
    async fn list_activities(&self, run_id: RunId) -> Result<Vec<Activity>, StorageError>;
}

//
// ─── IN-MEMORY IMPLEMENTATION ──────────────────────────────────────────────────
//

#[derive(Default)]
struct InMemoryState {
    runs: HashMap<RunId, SessionRun>,
    checkins: Vec<Checkin>,
    activities: Vec<Activity>,
    next_checkin_id: CheckinId,
    next_activity_id: ActivityId,
}

/// Simple in-memory repository implementation for testing and prototyping.
///
/// A single mutex guards all collections, so every guarded mutation is as
/// atomic as the SQL statements of the `SQLite` adapter.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

/// Rebuild a run snapshot with replaced fields, preserving everything else.
#[allow(clippy::too_many_arguments)]
fn rebuild_run(
    run: &SessionRun,
    status: RunStatus,
    last_progress_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    current_step_index: u32,
    payload: Value,
    abandon_reason: Option<String>,
) -> Result<SessionRun, StorageError> {
    SessionRun::from_persisted(
        run.id(),
        run.session_id(),
        run.user_id(),
        status,
        run.started_at(),
        last_progress_at,
        completed_at,
        abandoned_at,
        current_step_index,
        payload,
        run.idempotency_key().map(str::to_owned),
        abandon_reason,
    )
    .map_err(ser)
}

#[async_trait]
impl SessionRunRepository for InMemoryRepository {
    async fn insert_run(&self, record: &NewRunRecord) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if let Some(key) = record.idempotency_key.as_deref() {
            let duplicate = state.runs.values().any(|run| {
                run.session_id() == record.session_id && run.idempotency_key() == Some(key)
            });
            if duplicate {
                return Err(StorageError::Conflict);
            }
        }
        let run = record.clone().into_run().map_err(ser)?;
        state.runs.insert(run.id(), run);
        Ok(())
    }

    async fn find_run_by_key(
        &self,
        session_id: SessionId,
        idempotency_key: &str,
    ) -> Result<Option<SessionRun>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .runs
            .values()
            .find(|run| {
                run.session_id() == session_id && run.idempotency_key() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<SessionRun>, StorageError> {
        let state = self.lock()?;
        Ok(state.runs.get(&id).cloned())
    }

    async fn list_runs(
        &self,
        user_id: UserId,
        filter: &RunFilter,
    ) -> Result<Vec<SessionRun>, StorageError> {
        let state = self.lock()?;
        let mut runs: Vec<SessionRun> = state
            .runs
            .values()
            .filter(|run| run.user_id() == user_id)
            .filter(|run| filter.status.is_none_or(|status| run.status() == status))
            .filter(|run| {
                filter
                    .session_id
                    .is_none_or(|session| run.session_id() == session)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            b.started_at()
                .cmp(&a.started_at())
                .then_with(|| b.id().value().cmp(&a.id().value()))
        });
        Ok(runs)
    }

    async fn apply_progress(
        &self,
        id: RunId,
        step_index: Option<u32>,
        payload: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        let Some(run) = state.runs.get(&id) else {
            return Ok(false);
        };
        if !run.is_active() {
            return Ok(false);
        }
        if let Some(step) = step_index {
            if step < run.current_step_index() {
                return Ok(false);
            }
        }

        let updated = rebuild_run(
            run,
            RunStatus::Active,
            at,
            None,
            None,
            step_index.unwrap_or_else(|| run.current_step_index()),
            payload.cloned().unwrap_or_else(|| run.payload().clone()),
            None,
        )?;
        state.runs.insert(id, updated);
        Ok(true)
    }

    async fn mark_completed(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        let Some(run) = state.runs.get(&id) else {
            return Ok(false);
        };
        if !run.is_active() {
            return Ok(false);
        }

        let updated = rebuild_run(
            run,
            RunStatus::Completed,
            run.last_progress_at(),
            Some(at),
            None,
            run.current_step_index(),
            run.payload().clone(),
            None,
        )?;
        state.runs.insert(id, updated);
        Ok(true)
    }

    async fn mark_abandoned(
        &self,
        id: RunId,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        let Some(run) = state.runs.get(&id) else {
            return Ok(false);
        };
        if !run.is_active() {
            return Ok(false);
        }

        let updated = rebuild_run(
            run,
            RunStatus::Abandoned,
            run.last_progress_at(),
            None,
            Some(at),
            run.current_step_index(),
            run.payload().clone(),
            reason.map(str::to_owned),
        )?;
        state.runs.insert(id, updated);
        Ok(true)
    }
}

#[async_trait]
impl CheckinRepository for InMemoryRepository {
    async fn append_checkin(
        &self,
        run_id: RunId,
        body: &Value,
        at: DateTime<Utc>,
    ) -> Result<Option<CheckinId>, StorageError> {
        let mut state = self.lock()?;
        match state.runs.get(&run_id) {
            Some(run) if run.is_active() => {}
            _ => return Ok(None),
        }
        state.next_checkin_id += 1;
        let id = state.next_checkin_id;
        state
            .checkins
            .push(Checkin::from_persisted(id, run_id, at, body.clone()));
        Ok(Some(id))
    }

    async fn list_checkins(&self, run_id: RunId) -> Result<Vec<Checkin>, StorageError> {
        let state = self.lock()?;
        let mut items: Vec<Checkin> = state
            .checkins
            .iter()
            .filter(|checkin| checkin.run_id() == run_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(items)
    }
}

#[async_trait]
impl ActivityRepository for InMemoryRepository {
    async fn append_activity(
        &self,
        run_id: RunId,
        body: &Value,
        at: DateTime<Utc>,
    ) -> Result<Option<ActivityId>, StorageError> {
        let mut state = self.lock()?;
        match state.runs.get(&run_id) {
            Some(run) if run.is_active() => {}
            _ => return Ok(None),
        }
        state.next_activity_id += 1;
        let id = state.next_activity_id;
        state
            .activities
            .push(Activity::from_persisted(id, run_id, at, body.clone()));
        Ok(Some(id))
    }

    async fn list_activities(&self, run_id: RunId) -> Result<Vec<Activity>, StorageError> {
        let state = self.lock()?;
        let mut items: Vec<Activity> = state
            .activities
            .iter()
            .filter(|activity| activity.run_id() == run_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(items)
    }
}

/// Aggregates run repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub runs: Arc<dyn SessionRunRepository>,
    pub checkins: Arc<dyn CheckinRepository>,
    pub activities: Arc<dyn ActivityRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let runs: Arc<dyn SessionRunRepository> = Arc::new(repo.clone());
        let checkins: Arc<dyn CheckinRepository> = Arc::new(repo.clone());
        let activities: Arc<dyn ActivityRepository> = Arc::new(repo);
        Self {
            runs,
            checkins,
            activities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runs_core::time::fixed_now;
    use serde_json::json;
    use uuid::Uuid;

    fn new_record(key: Option<&str>) -> NewRunRecord {
        NewRunRecord::started(
            RunId::generate(),
            SessionId::new(Uuid::from_u128(1)),
            UserId::new(Uuid::from_u128(2)),
            fixed_now(),
            key.map(str::to_owned),
        )
    }

    #[tokio::test]
    async fn duplicate_key_conflicts() {
        let repo = InMemoryRepository::new();
        repo.insert_run(&new_record(Some("k1"))).await.unwrap();

        let err = repo.insert_run(&new_record(Some("k1"))).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));

        // A missing key never conflicts.
        repo.insert_run(&new_record(None)).await.unwrap();
        repo.insert_run(&new_record(None)).await.unwrap();
    }

    #[tokio::test]
    async fn guarded_progress_rejects_stale_step() {
        let repo = InMemoryRepository::new();
        let record = new_record(Some("k1"));
        let run_id = record.id;
        repo.insert_run(&record).await.unwrap();

        assert!(
            repo.apply_progress(run_id, Some(3), None, fixed_now())
                .await
                .unwrap()
        );
        assert!(
            !repo
                .apply_progress(run_id, Some(1), None, fixed_now())
                .await
                .unwrap()
        );

        let run = repo.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.current_step_index(), 3);
    }

    #[tokio::test]
    async fn terminal_runs_refuse_appends() {
        let repo = InMemoryRepository::new();
        let record = new_record(None);
        let run_id = record.id;
        repo.insert_run(&record).await.unwrap();

        assert!(repo.mark_completed(run_id, fixed_now()).await.unwrap());
        assert!(!repo.mark_completed(run_id, fixed_now()).await.unwrap());

        let appended = repo
            .append_checkin(run_id, &json!({"confidence": 2}), fixed_now())
            .await
            .unwrap();
        assert!(appended.is_none());
    }
}
