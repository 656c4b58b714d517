use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::model::{RunId, SessionId, UserId};

//
// ─── RUN STATUS ────────────────────────────────────────────────────────────────
//

/// Lifecycle state of a session run.
///
/// `Pending` is transient: a run collapses to `Active` at creation, so a
/// persisted `Pending` row can only come from an external writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Pending,
    Active,
    Completed,
    Abandoned,
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Abandoned)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
            RunStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

//
// ─── SESSION RUN ───────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunError {
    #[error("last_progress_at is before started_at")]
    ProgressBeforeStart,

    #[error("terminal timestamp is before started_at")]
    InvalidTimeRange,

    #[error("{status} run is missing its terminal timestamp")]
    MissingTerminalTimestamp { status: RunStatus },

    #[error("{field} is not valid on a {status} run")]
    UnexpectedTimestamp {
        field: &'static str,
        status: RunStatus,
    },

    #[error("abandon_reason is only valid on abandoned runs")]
    UnexpectedAbandonReason,
}

/// One attempt at working through a session definition, tracked from start
/// to completion or abandonment.
///
/// The run only back-references its session definition and owner; both live
/// outside this subsystem. Mutation happens exclusively through the storage
/// layer's guarded statements, so this aggregate is a read-only snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRun {
    id: RunId,
    session_id: SessionId,
    user_id: UserId,
    status: RunStatus,
    started_at: DateTime<Utc>,
    last_progress_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    current_step_index: u32,
    payload: Value,
    idempotency_key: Option<String>,
    abandon_reason: Option<String>,
}

impl SessionRun {
    /// Rehydrate a run from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `RunError` when timestamps or terminal metadata do not agree
    /// with `status`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: RunId,
        session_id: SessionId,
        user_id: UserId,
        status: RunStatus,
        started_at: DateTime<Utc>,
        last_progress_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
        abandoned_at: Option<DateTime<Utc>>,
        current_step_index: u32,
        payload: Value,
        idempotency_key: Option<String>,
        abandon_reason: Option<String>,
    ) -> Result<Self, RunError> {
        if last_progress_at < started_at {
            return Err(RunError::ProgressBeforeStart);
        }

        match status {
            RunStatus::Completed => {
                let at = completed_at.ok_or(RunError::MissingTerminalTimestamp { status })?;
                if at < started_at {
                    return Err(RunError::InvalidTimeRange);
                }
                if abandoned_at.is_some() {
                    return Err(RunError::UnexpectedTimestamp {
                        field: "abandoned_at",
                        status,
                    });
                }
            }
            RunStatus::Abandoned => {
                let at = abandoned_at.ok_or(RunError::MissingTerminalTimestamp { status })?;
                if at < started_at {
                    return Err(RunError::InvalidTimeRange);
                }
                if completed_at.is_some() {
                    return Err(RunError::UnexpectedTimestamp {
                        field: "completed_at",
                        status,
                    });
                }
            }
            RunStatus::Pending | RunStatus::Active => {
                if completed_at.is_some() {
                    return Err(RunError::UnexpectedTimestamp {
                        field: "completed_at",
                        status,
                    });
                }
                if abandoned_at.is_some() {
                    return Err(RunError::UnexpectedTimestamp {
                        field: "abandoned_at",
                        status,
                    });
                }
            }
        }

        if abandon_reason.is_some() && status != RunStatus::Abandoned {
            return Err(RunError::UnexpectedAbandonReason);
        }

        Ok(Self {
            id,
            session_id,
            user_id,
            status,
            started_at,
            last_progress_at,
            completed_at,
            abandoned_at,
            current_step_index,
            payload,
            idempotency_key,
            abandon_reason,
        })
    }

    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn last_progress_at(&self) -> DateTime<Utc> {
        self.last_progress_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn abandoned_at(&self) -> Option<DateTime<Utc>> {
        self.abandoned_at
    }

    #[must_use]
    pub fn current_step_index(&self) -> u32 {
        self.current_step_index
    }

    /// Opaque, caller-defined progress blob; stored and returned verbatim.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    #[must_use]
    pub fn abandon_reason(&self) -> Option<&str> {
        self.abandon_reason.as_deref()
    }

    /// True once the run reached `completed` or `abandoned`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True while progress saves and sub-record appends are legal.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
