use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::RunId;

/// Storage identifier for a persisted check-in.
///
/// NOTE: This is currently `i64` to match `SQLite` row IDs.
pub type CheckinId = i64;

/// A point-in-time reflection or confidence signal recorded during a run.
///
/// Check-ins are append-only: once written they are never mutated or
/// deleted, and they can only be attached while the run is active.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkin {
    id: CheckinId,
    run_id: RunId,
    created_at: DateTime<Utc>,
    body: Value,
}

impl Checkin {
    /// Rehydrate a check-in from persisted storage.
    #[must_use]
    pub fn from_persisted(
        id: CheckinId,
        run_id: RunId,
        created_at: DateTime<Utc>,
        body: Value,
    ) -> Self {
        Self {
            id,
            run_id,
            created_at,
            body,
        }
    }

    #[must_use]
    pub fn id(&self) -> CheckinId {
        self.id
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Opaque, caller-defined body; stored and returned verbatim.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }
}
