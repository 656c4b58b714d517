use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::RunId;

/// Storage identifier for a persisted activity.
///
/// NOTE: This is currently `i64` to match `SQLite` row IDs.
pub type ActivityId = i64;

/// A discrete action taken during a run (an answer submission, a
/// navigation event, …).
///
/// Activities share the shape of check-ins but carry a different
/// caller-defined body schema and live in their own collection; the two are
/// never unioned.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    id: ActivityId,
    run_id: RunId,
    created_at: DateTime<Utc>,
    body: Value,
}

impl Activity {
    /// Rehydrate an activity from persisted storage.
    #[must_use]
    pub fn from_persisted(
        id: ActivityId,
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
    pub fn id(&self) -> ActivityId {
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
