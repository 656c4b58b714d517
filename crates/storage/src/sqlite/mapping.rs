use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use runs_core::model::{Activity, Checkin, RunId, RunStatus, SessionId, SessionRun, UserId};

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn uuid_from_text(field: &'static str, raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|_| StorageError::Serialization(format!("invalid {field}: {raw}")))
}

pub(crate) fn run_id_from_text(raw: &str) -> Result<RunId, StorageError> {
    Ok(RunId::new(uuid_from_text("run id", raw)?))
}

pub(crate) fn session_id_from_text(raw: &str) -> Result<SessionId, StorageError> {
    Ok(SessionId::new(uuid_from_text("session id", raw)?))
}

pub(crate) fn user_id_from_text(raw: &str) -> Result<UserId, StorageError> {
    Ok(UserId::new(uuid_from_text("user id", raw)?))
}

pub(crate) fn step_index_from_i64(v: i64) -> Result<u32, StorageError> {
    u32::try_from(v)
        .map_err(|_| StorageError::Serialization(format!("invalid current_step_index: {v}")))
}

/// Converts a `RunStatus` to its storage representation.
/// This must stay consistent with `parse_run_status`.
pub(crate) fn run_status_as_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Active => "active",
        RunStatus::Completed => "completed",
        RunStatus::Abandoned => "abandoned",
    }
}

pub(crate) fn parse_run_status(s: &str) -> Result<RunStatus, StorageError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "active" => Ok(RunStatus::Active),
        "completed" => Ok(RunStatus::Completed),
        "abandoned" => Ok(RunStatus::Abandoned),
        _ => Err(StorageError::Serialization(format!("invalid status: {s}"))),
    }
}

/// Opaque blobs travel as JSON text; the store never inspects them.
pub(crate) fn json_to_text(value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(ser)
}

pub(crate) fn json_from_text(raw: &str) -> Result<Value, StorageError> {
    serde_json::from_str(raw).map_err(ser)
}

pub(crate) fn map_run_row(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRun, StorageError> {
    let id = run_id_from_text(row.try_get::<String, _>("id").map_err(ser)?.as_str())?;
    let session_id =
        session_id_from_text(row.try_get::<String, _>("session_id").map_err(ser)?.as_str())?;
    let user_id = user_id_from_text(row.try_get::<String, _>("user_id").map_err(ser)?.as_str())?;

    let status_str: String = row.try_get("status").map_err(ser)?;
    let status = parse_run_status(status_str.as_str())?;

    let current_step_index =
        step_index_from_i64(row.try_get::<i64, _>("current_step_index").map_err(ser)?)?;
    let payload = json_from_text(row.try_get::<String, _>("payload").map_err(ser)?.as_str())?;

    SessionRun::from_persisted(
        id,
        session_id,
        user_id,
        status,
        row.try_get("started_at").map_err(ser)?,
        row.try_get("last_progress_at").map_err(ser)?,
        row.try_get("completed_at").map_err(ser)?,
        row.try_get("abandoned_at").map_err(ser)?,
        current_step_index,
        payload,
        row.try_get("idempotency_key").map_err(ser)?,
        row.try_get("abandon_reason").map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) fn map_checkin_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkin, StorageError> {
    let run_id = run_id_from_text(row.try_get::<String, _>("run_id").map_err(ser)?.as_str())?;
    let body = json_from_text(row.try_get::<String, _>("body").map_err(ser)?.as_str())?;
    Ok(Checkin::from_persisted(
        row.try_get("id").map_err(ser)?,
        run_id,
        row.try_get("created_at").map_err(ser)?,
        body,
    ))
}

pub(crate) fn map_activity_row(row: &sqlx::sqlite::SqliteRow) -> Result<Activity, StorageError> {
    let run_id = run_id_from_text(row.try_get::<String, _>("run_id").map_err(ser)?.as_str())?;
    let body = json_from_text(row.try_get::<String, _>("body").map_err(ser)?.as_str())?;
    Ok(Activity::from_persisted(
        row.try_get("id").map_err(ser)?,
        run_id,
        row.try_get("created_at").map_err(ser)?,
        body,
    ))
}
