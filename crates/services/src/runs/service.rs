use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use runs_core::model::{
    Activity, Caller, Checkin, RunId, RunStatus, SessionId, SessionRun, UserId,
};
use storage::repository::{
    ActivityRepository, CheckinRepository, NewRunRecord, RunFilter, SessionRunRepository,
    StorageError,
};

use super::directory::SessionDirectory;
use super::progress::{ProgressUpdate, RunProgress};
use crate::Clock;
use crate::error::RunServiceError;

//
// ─── START OUTCOME ─────────────────────────────────────────────────────────────
//

/// Result of `start`: the run plus whether this call created it.
///
/// The HTTP layer maps `created` to 201 and a replay to 200.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub run: SessionRun,
    pub created: bool,
}

//
// ─── RUN LIFECYCLE SERVICE ─────────────────────────────────────────────────────
//

/// Orchestrates the run lifecycle: idempotent start, guarded state
/// transitions, monotonic progress writes, and append-only sub-records.
///
/// The service holds no cross-call state; every invariant that spans
/// concurrent callers lives in the store's conditional statements. Each
/// operation authorizes through one load-and-check helper before touching
/// anything.
#[derive(Clone)]
pub struct RunLifecycleService {
    clock: Clock,
    sessions: Arc<dyn SessionDirectory>,
    runs: Arc<dyn SessionRunRepository>,
    checkins: Arc<dyn CheckinRepository>,
    activities: Arc<dyn ActivityRepository>,
}

impl RunLifecycleService {
    #[must_use]
    pub fn new(
        clock: Clock,
        sessions: Arc<dyn SessionDirectory>,
        runs: Arc<dyn SessionRunRepository>,
        checkins: Arc<dyn CheckinRepository>,
        activities: Arc<dyn ActivityRepository>,
    ) -> Self {
        Self {
            clock,
            sessions,
            runs,
            checkins,
            activities,
        }
    }

    fn require_user(caller: &Caller) -> Result<UserId, RunServiceError> {
        caller.user_id().ok_or(RunServiceError::Unauthenticated)
    }

    /// Load a run and verify the caller owns it.
    ///
    /// Ownership mismatch is `Forbidden`, kept distinct from `NotFound`;
    /// masking one as the other is the HTTP layer's call to make.
    async fn load_owned(
        &self,
        run_id: RunId,
        user_id: UserId,
    ) -> Result<SessionRun, RunServiceError> {
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or(RunServiceError::NotFound)?;
        if run.user_id() != user_id {
            return Err(RunServiceError::Forbidden);
        }
        Ok(run)
    }

    fn replayed(run: SessionRun, user_id: UserId) -> Result<StartOutcome, RunServiceError> {
        if run.user_id() != user_id {
            return Err(RunServiceError::Forbidden);
        }
        debug!(run_id = %run.id(), "start replayed onto existing run");
        Ok(StartOutcome {
            run,
            created: false,
        })
    }

    /// Start a run for the given session, or replay a previous start.
    ///
    /// Without a key every call creates a fresh run. With a key the insert
    /// rides the store's (`session_id`, `idempotency_key`) uniqueness: of
    /// two concurrent starts exactly one observes `created`, the other gets
    /// the same run back.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` for anonymous callers, `InvalidSession`
    /// when the session lookup refuses, `Forbidden` when a replayed run is
    /// owned by someone else, or `RunServiceError::Storage` on storage
    /// failures.
    pub async fn start(
        &self,
        caller: &Caller,
        session_id: SessionId,
        idempotency_key: Option<String>,
    ) -> Result<StartOutcome, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        if !self.sessions.can_access(session_id, user_id).await? {
            return Err(RunServiceError::InvalidSession);
        }

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.runs.find_run_by_key(session_id, key).await? {
                return Self::replayed(existing, user_id);
            }
        }

        let record = NewRunRecord::started(
            RunId::generate(),
            session_id,
            user_id,
            self.clock.now(),
            idempotency_key.clone(),
        );

        match self.runs.insert_run(&record).await {
            Ok(()) => {
                debug!(run_id = %record.id, session_id = %session_id, "run started");
                let run = record
                    .into_run()
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(StartOutcome { run, created: true })
            }
            Err(StorageError::Conflict) => {
                // Lost the insert race; the rival's run is the answer. The
                // conflict stays internal.
                let Some(key) = idempotency_key.as_deref() else {
                    return Err(RunServiceError::Storage(StorageError::Conflict));
                };
                let existing = self
                    .runs
                    .find_run_by_key(session_id, key)
                    .await?
                    .ok_or(RunServiceError::Storage(StorageError::Conflict))?;
                Self::replayed(existing, user_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a run owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`Forbidden` per ownership, or storage errors.
    pub async fn fetch(
        &self,
        caller: &Caller,
        run_id: RunId,
    ) -> Result<SessionRun, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        self.load_owned(run_id, user_id).await
    }

    /// Aggregated progress view of a run owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`Forbidden` per ownership, or storage errors.
    pub async fn progress(
        &self,
        caller: &Caller,
        run_id: RunId,
    ) -> Result<RunProgress, RunServiceError> {
        let run = self.fetch(caller, run_id).await?;
        Ok(RunProgress::from_run(&run))
    }

    /// List the caller's runs, newest started first.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` for anonymous callers, or storage errors.
    pub async fn list_runs(
        &self,
        caller: &Caller,
        filter: &RunFilter,
    ) -> Result<Vec<SessionRun>, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        Ok(self.runs.list_runs(user_id, filter).await?)
    }

    /// Write progress to an active run and return the updated record.
    ///
    /// # Errors
    ///
    /// Returns `RunClosed` on a terminal run, `StaleProgress` when
    /// `step_index` goes backwards, ownership errors, or storage errors.
    pub async fn save_progress(
        &self,
        caller: &Caller,
        run_id: RunId,
        update: ProgressUpdate,
    ) -> Result<SessionRun, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        let run = self.load_owned(run_id, user_id).await?;
        Self::check_writable(&run, update.step_index)?;

        let applied = self
            .runs
            .apply_progress(
                run_id,
                update.step_index,
                update.payload.as_ref(),
                self.clock.now(),
            )
            .await?;

        if !applied {
            // The guard missed: the run moved between the load above and
            // the write. Classify against fresh state.
            let current = self.load_owned(run_id, user_id).await?;
            Self::check_writable(&current, update.step_index)?;
            // Progress never regresses and terminal states never reopen,
            // so a fresh writable run cannot have missed the guard.
            return Err(RunServiceError::Storage(StorageError::Conflict));
        }

        debug!(run_id = %run_id, step = ?update.step_index, "progress saved");
        self.load_owned(run_id, user_id).await
    }

    fn check_writable(run: &SessionRun, step_index: Option<u32>) -> Result<(), RunServiceError> {
        if run.is_terminal() {
            return Err(RunServiceError::RunClosed);
        }
        if let Some(step) = step_index {
            if step < run.current_step_index() {
                return Err(RunServiceError::StaleProgress {
                    current: run.current_step_index(),
                    supplied: step,
                });
            }
        }
        Ok(())
    }

    /// Transition an active run to `completed`.
    ///
    /// Repeating the call on a completed run succeeds and leaves
    /// `completed_at` untouched, so clients may retry after a lost
    /// response.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` from `abandoned` (or a stray
    /// `pending`), ownership errors, or storage errors.
    pub async fn complete(
        &self,
        caller: &Caller,
        run_id: RunId,
    ) -> Result<SessionRun, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        let run = self.load_owned(run_id, user_id).await?;
        match run.status() {
            RunStatus::Completed => return Ok(run),
            RunStatus::Active => {}
            from => return Err(RunServiceError::InvalidTransition { from }),
        }

        if self.runs.mark_completed(run_id, self.clock.now()).await? {
            debug!(run_id = %run_id, "run completed");
            return self.load_owned(run_id, user_id).await;
        }

        // Someone else closed the run first; answer as if we arrived late.
        let current = self.load_owned(run_id, user_id).await?;
        match current.status() {
            RunStatus::Completed => Ok(current),
            from => Err(RunServiceError::InvalidTransition { from }),
        }
    }

    /// Transition an active run to `abandoned`, optionally recording why.
    ///
    /// Repeating the call on an abandoned run succeeds; the stored reason
    /// and `abandoned_at` win over the retry's.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` from `completed` (or a stray
    /// `pending`), ownership errors, or storage errors.
    pub async fn abandon(
        &self,
        caller: &Caller,
        run_id: RunId,
        reason: Option<String>,
    ) -> Result<SessionRun, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        let run = self.load_owned(run_id, user_id).await?;
        match run.status() {
            RunStatus::Abandoned => return Ok(run),
            RunStatus::Active => {}
            from => return Err(RunServiceError::InvalidTransition { from }),
        }

        if self
            .runs
            .mark_abandoned(run_id, reason.as_deref(), self.clock.now())
            .await?
        {
            debug!(run_id = %run_id, "run abandoned");
            return self.load_owned(run_id, user_id).await;
        }

        let current = self.load_owned(run_id, user_id).await?;
        match current.status() {
            RunStatus::Abandoned => Ok(current),
            from => Err(RunServiceError::InvalidTransition { from }),
        }
    }

    /// Record a check-in on an active run.
    ///
    /// # Errors
    ///
    /// Returns `RunClosed` on a terminal run, ownership errors, or storage
    /// errors.
    pub async fn create_checkin(
        &self,
        caller: &Caller,
        run_id: RunId,
        body: Value,
    ) -> Result<Checkin, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        let run = self.load_owned(run_id, user_id).await?;
        if run.is_terminal() {
            return Err(RunServiceError::RunClosed);
        }

        let at = self.clock.now();
        match self.checkins.append_checkin(run_id, &body, at).await? {
            Some(id) => Ok(Checkin::from_persisted(id, run_id, at, body)),
            // The run closed between the ownership check and the append.
            None => Err(RunServiceError::RunClosed),
        }
    }

    /// List check-ins for a run owned by the caller, oldest first.
    ///
    /// # Errors
    ///
    /// Returns ownership errors or storage errors.
    pub async fn list_checkins(
        &self,
        caller: &Caller,
        run_id: RunId,
    ) -> Result<Vec<Checkin>, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        self.load_owned(run_id, user_id).await?;
        Ok(self.checkins.list_checkins(run_id).await?)
    }

    /// Record an activity on an active run.
    ///
    /// # Errors
    ///
    /// Returns `RunClosed` on a terminal run, ownership errors, or storage
    /// errors.
    pub async fn create_activity(
        &self,
        caller: &Caller,
        run_id: RunId,
        body: Value,
    ) -> Result<Activity, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        let run = self.load_owned(run_id, user_id).await?;
        if run.is_terminal() {
            return Err(RunServiceError::RunClosed);
        }

        let at = self.clock.now();
        match self.activities.append_activity(run_id, &body, at).await? {
            Some(id) => Ok(Activity::from_persisted(id, run_id, at, body)),
            None => Err(RunServiceError::RunClosed),
        }
    }

    /// List activities for a run owned by the caller, oldest first.
    ///
    /// # Errors
    ///
    /// Returns ownership errors or storage errors.
    pub async fn list_activities(
        &self,
        caller: &Caller,
        run_id: RunId,
    ) -> Result<Vec<Activity>, RunServiceError> {
        let user_id = Self::require_user(caller)?;
        self.load_owned(run_id, user_id).await?;
        Ok(self.activities.list_activities(run_id).await?)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
