use chrono::{DateTime, Utc};
use serde_json::Value;

use runs_core::model::{Activity, ActivityId, RunId};

use super::SqliteRepository;
use super::mapping::{json_to_text, map_activity_row};
use crate::repository::{ActivityRepository, StorageError};

#[async_trait::async_trait]
impl ActivityRepository for SqliteRepository {
    async fn append_activity(
        &self,
        run_id: RunId,
        body: &Value,
        at: DateTime<Utc>,
    ) -> Result<Option<ActivityId>, StorageError> {
        let body_text = json_to_text(body)?;

        // Same single-statement liveness guard as check-ins.
        let result = sqlx::query(
            r"
                INSERT INTO run_activities (run_id, created_at, body)
                SELECT ?1, ?2, ?3
                WHERE EXISTS (
                    SELECT 1 FROM session_runs WHERE id = ?1 AND status = 'active'
                )
            ",
        )
        .bind(run_id.value().to_string())
        .bind(at)
        .bind(body_text)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    async fn list_activities(&self, run_id: RunId) -> Result<Vec<Activity>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT id, run_id, created_at, body
                FROM run_activities
                WHERE run_id = ?1
                ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(run_id.value().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_activity_row(&row)?);
        }

        Ok(out)
    }
}
