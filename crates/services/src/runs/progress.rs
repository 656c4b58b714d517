use chrono::{DateTime, Utc};
use serde_json::Value;

use runs_core::model::{RunStatus, SessionRun};

/// Partial progress write for an active run.
///
/// `payload` is shallow-replaced: the caller sends the full blob each time
/// and the tracker never merges fields. A fully empty update is still a
/// valid save and refreshes `last_progress_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub step_index: Option<u32>,
    pub payload: Option<Value>,
}

/// Aggregated view of run progress, useful for UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub status: RunStatus,
    pub step_index: u32,
    pub last_progress_at: DateTime<Utc>,
    pub is_terminal: bool,
}

impl RunProgress {
    #[must_use]
    pub fn from_run(run: &SessionRun) -> Self {
        Self {
            status: run.status(),
            step_index: run.current_step_index(),
            last_progress_at: run.last_progress_at(),
            is_terminal: run.is_terminal(),
        }
    }
}
