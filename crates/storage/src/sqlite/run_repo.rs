use chrono::{DateTime, Utc};
use serde_json::Value;

use runs_core::model::{RunId, SessionId, SessionRun, UserId};

use super::SqliteRepository;
use super::mapping::{json_to_text, map_run_row, run_status_as_str};
use crate::repository::{NewRunRecord, RunFilter, SessionRunRepository, StorageError};

#[async_trait::async_trait]
impl SessionRunRepository for SqliteRepository {
    async fn insert_run(&self, record: &NewRunRecord) -> Result<(), StorageError> {
        let payload = json_to_text(&record.payload)?;

        let res = sqlx::query(
            r"
                INSERT INTO session_runs (
                    id, session_id, user_id, status, started_at, last_progress_at,
                    current_step_index, payload, idempotency_key
                )
                VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(record.id.value().to_string())
        .bind(record.session_id.value().to_string())
        .bind(record.user_id.value().to_string())
        .bind(record.started_at)
        .bind(record.started_at)
        .bind(i64::from(record.current_step_index))
        .bind(payload)
        .bind(record.idempotency_key.as_deref())
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::Conflict)
            }
            Err(e) => Err(StorageError::Connection(e.to_string())),
        }
    }

    async fn find_run_by_key(
        &self,
        session_id: SessionId,
        idempotency_key: &str,
    ) -> Result<Option<SessionRun>, StorageError> {
        let row = sqlx::query(
            r"
                SELECT
                    id, session_id, user_id, status, started_at, last_progress_at,
                    completed_at, abandoned_at, current_step_index, payload,
                    idempotency_key, abandon_reason
                FROM session_runs
                WHERE session_id = ?1 AND idempotency_key = ?2
            ",
        )
        .bind(session_id.value().to_string())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        row.as_ref().map(map_run_row).transpose()
    }

    async fn get_run(&self, id: RunId) -> Result<Option<SessionRun>, StorageError> {
        let row = sqlx::query(
            r"
                SELECT
                    id, session_id, user_id, status, started_at, last_progress_at,
                    completed_at, abandoned_at, current_step_index, payload,
                    idempotency_key, abandon_reason
                FROM session_runs
                WHERE id = ?1
            ",
        )
        .bind(id.value().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        row.as_ref().map(map_run_row).transpose()
    }

    async fn list_runs(
        &self,
        user_id: UserId,
        filter: &RunFilter,
    ) -> Result<Vec<SessionRun>, StorageError> {
        let mut sql = String::from(
            r"
                SELECT
                    id, session_id, user_id, status, started_at, last_progress_at,
                    completed_at, abandoned_at, current_step_index, payload,
                    idempotency_key, abandon_reason
                FROM session_runs
                WHERE user_id = ?1
            ",
        );

        let mut bind_index = 2;
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
            sql.push_str(&bind_index.to_string());
            bind_index += 1;
        }
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
            sql.push_str(&bind_index.to_string());
        }
        sql.push_str(" ORDER BY started_at DESC, id DESC");

        let mut query = sqlx::query(&sql).bind(user_id.value().to_string());
        if let Some(status) = filter.status {
            query = query.bind(run_status_as_str(status));
        }
        if let Some(session_id) = filter.session_id {
            query = query.bind(session_id.value().to_string());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_run_row(&row)?);
        }

        Ok(out)
    }

    async fn apply_progress(
        &self,
        id: RunId,
        step_index: Option<u32>,
        payload: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let payload_text = payload.map(json_to_text).transpose()?;

        // One conditional statement: the active-status guard and the
        // monotonicity guard ride with the write itself.
        let mut sql = String::from("UPDATE session_runs SET last_progress_at = ?1");
        let mut bind_index = 2;
        if step_index.is_some() {
            sql.push_str(", current_step_index = ?");
            sql.push_str(&bind_index.to_string());
            bind_index += 1;
        }
        if payload_text.is_some() {
            sql.push_str(", payload = ?");
            sql.push_str(&bind_index.to_string());
            bind_index += 1;
        }
        sql.push_str(" WHERE id = ?");
        sql.push_str(&bind_index.to_string());
        bind_index += 1;
        sql.push_str(" AND status = 'active'");
        if step_index.is_some() {
            sql.push_str(" AND current_step_index <= ?");
            sql.push_str(&bind_index.to_string());
        }

        let mut query = sqlx::query(&sql).bind(at);
        if let Some(step) = step_index {
            query = query.bind(i64::from(step));
        }
        if let Some(text) = payload_text {
            query = query.bind(text);
        }
        query = query.bind(id.value().to_string());
        if let Some(step) = step_index {
            query = query.bind(i64::from(step));
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r"
                UPDATE session_runs
                SET status = 'completed', completed_at = ?2
                WHERE id = ?1 AND status = 'active'
            ",
        )
        .bind(id.value().to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_abandoned(
        &self,
        id: RunId,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r"
                UPDATE session_runs
                SET status = 'abandoned', abandoned_at = ?2, abandon_reason = ?3
                WHERE id = ?1 AND status = 'active'
            ",
        )
        .bind(id.value().to_string())
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
