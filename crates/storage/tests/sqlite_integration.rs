use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use runs_core::model::{RunId, RunStatus, SessionId, UserId};
use runs_core::time::fixed_now;
use storage::repository::{
    ActivityRepository, CheckinRepository, NewRunRecord, RunFilter, SessionRunRepository,
    StorageError,
};
use storage::sqlite::SqliteRepository;

fn session(n: u128) -> SessionId {
    SessionId::new(Uuid::from_u128(n))
}

fn user(n: u128) -> UserId {
    UserId::new(Uuid::from_u128(n))
}

fn record(
    session_id: SessionId,
    user_id: UserId,
    key: Option<&str>,
    started_at: chrono::DateTime<chrono::Utc>,
) -> NewRunRecord {
    NewRunRecord::started(
        RunId::generate(),
        session_id,
        user_id,
        started_at,
        key.map(str::to_owned),
    )
}

async fn connect(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

#[tokio::test]
async fn sqlite_run_roundtrip() {
    let repo = connect("memdb_run_roundtrip").await;
    let now = fixed_now();

    let new_run = record(session(1), user(2), Some("k1"), now);
    repo.insert_run(&new_run).await.unwrap();

    let run = repo.get_run(new_run.id).await.unwrap().expect("run exists");
    assert_eq!(run.id(), new_run.id);
    assert_eq!(run.session_id(), session(1));
    assert_eq!(run.user_id(), user(2));
    assert_eq!(run.status(), RunStatus::Active);
    assert_eq!(run.started_at(), now);
    assert_eq!(run.last_progress_at(), now);
    assert_eq!(run.current_step_index(), 0);
    assert_eq!(run.idempotency_key(), Some("k1"));
    assert!(run.payload().is_null());
}

#[tokio::test]
async fn sqlite_duplicate_key_conflicts() {
    let repo = connect("memdb_dup_key").await;
    let now = fixed_now();

    let first = record(session(1), user(2), Some("k1"), now);
    repo.insert_run(&first).await.unwrap();

    let err = repo
        .insert_run(&record(session(1), user(2), Some("k1"), now))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    // Same key under a different session is a different pair.
    repo.insert_run(&record(session(9), user(2), Some("k1"), now))
        .await
        .unwrap();

    // Keyless starts never collide.
    repo.insert_run(&record(session(1), user(2), None, now))
        .await
        .unwrap();
    repo.insert_run(&record(session(1), user(2), None, now))
        .await
        .unwrap();

    let found = repo
        .find_run_by_key(session(1), "k1")
        .await
        .unwrap()
        .expect("found by key");
    assert_eq!(found.id(), first.id);
}

#[tokio::test]
async fn sqlite_progress_is_monotonic_and_replaces_payload() {
    let repo = connect("memdb_progress").await;
    let now = fixed_now();

    let new_run = record(session(1), user(2), None, now);
    repo.insert_run(&new_run).await.unwrap();

    let later = now + Duration::minutes(1);
    assert!(
        repo.apply_progress(new_run.id, Some(3), Some(&json!({"answers": [1, 2, 3]})), later)
            .await
            .unwrap()
    );

    // A lower step index does not land.
    assert!(
        !repo
            .apply_progress(new_run.id, Some(1), Some(&json!({"answers": []})), later)
            .await
            .unwrap()
    );

    // Equal step index is allowed (payload-only refresh).
    assert!(
        repo.apply_progress(new_run.id, Some(3), None, later + Duration::minutes(1))
            .await
            .unwrap()
    );

    let run = repo.get_run(new_run.id).await.unwrap().unwrap();
    assert_eq!(run.current_step_index(), 3);
    assert_eq!(run.payload(), &json!({"answers": [1, 2, 3]}));
    assert_eq!(run.last_progress_at(), later + Duration::minutes(1));
}

#[tokio::test]
async fn sqlite_terminal_transitions_are_guarded() {
    let repo = connect("memdb_terminal").await;
    let now = fixed_now();

    let new_run = record(session(1), user(2), None, now);
    repo.insert_run(&new_run).await.unwrap();

    let done_at = now + Duration::minutes(10);
    assert!(repo.mark_completed(new_run.id, done_at).await.unwrap());
    // Second completion and cross-transition both miss the guard.
    assert!(
        !repo
            .mark_completed(new_run.id, done_at + Duration::minutes(1))
            .await
            .unwrap()
    );
    assert!(
        !repo
            .mark_abandoned(new_run.id, Some("late"), done_at)
            .await
            .unwrap()
    );
    // So does any further progress.
    assert!(
        !repo
            .apply_progress(new_run.id, Some(9), None, done_at)
            .await
            .unwrap()
    );

    let run = repo.get_run(new_run.id).await.unwrap().unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.completed_at(), Some(done_at));
    assert_eq!(run.abandoned_at(), None);
}

#[tokio::test]
async fn sqlite_abandon_stores_reason() {
    let repo = connect("memdb_abandon").await;
    let now = fixed_now();

    let new_run = record(session(1), user(2), None, now);
    repo.insert_run(&new_run).await.unwrap();

    let gone_at = now + Duration::minutes(3);
    assert!(
        repo.mark_abandoned(new_run.id, Some("lost interest"), gone_at)
            .await
            .unwrap()
    );

    let run = repo.get_run(new_run.id).await.unwrap().unwrap();
    assert_eq!(run.status(), RunStatus::Abandoned);
    assert_eq!(run.abandoned_at(), Some(gone_at));
    assert_eq!(run.abandon_reason(), Some("lost interest"));
}

#[tokio::test]
async fn sqlite_appends_are_ordered_and_stop_at_terminal() {
    let repo = connect("memdb_appends").await;
    let now = fixed_now();

    let new_run = record(session(1), user(2), None, now);
    repo.insert_run(&new_run).await.unwrap();

    let first = repo
        .append_checkin(new_run.id, &json!({"confidence": 1}), now + Duration::minutes(1))
        .await
        .unwrap()
        .expect("appended");
    let second = repo
        .append_checkin(new_run.id, &json!({"confidence": 4}), now + Duration::minutes(2))
        .await
        .unwrap()
        .expect("appended");
    repo.append_activity(new_run.id, &json!({"kind": "answer"}), now + Duration::minutes(1))
        .await
        .unwrap()
        .expect("appended");

    let checkins = repo.list_checkins(new_run.id).await.unwrap();
    assert_eq!(checkins.len(), 2);
    assert_eq!(checkins[0].id(), first);
    assert_eq!(checkins[1].id(), second);
    assert!(checkins[0].created_at() < checkins[1].created_at());

    // The two collections stay independent.
    let activities = repo.list_activities(new_run.id).await.unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].body(), &json!({"kind": "answer"}));

    repo.mark_completed(new_run.id, now + Duration::minutes(5))
        .await
        .unwrap();

    let refused = repo
        .append_checkin(new_run.id, &json!({"confidence": 5}), now + Duration::minutes(6))
        .await
        .unwrap();
    assert!(refused.is_none());
    let refused = repo
        .append_activity(new_run.id, &json!({"kind": "late"}), now + Duration::minutes(6))
        .await
        .unwrap();
    assert!(refused.is_none());
}

#[tokio::test]
async fn sqlite_list_runs_filters_and_orders() {
    let repo = connect("memdb_list_runs").await;
    let now = fixed_now();

    let older = record(session(1), user(2), None, now - Duration::hours(2));
    let newer = record(session(1), user(2), None, now);
    let other_session = record(session(9), user(2), None, now - Duration::hours(1));
    let other_user = record(session(1), user(7), None, now);
    repo.insert_run(&older).await.unwrap();
    repo.insert_run(&newer).await.unwrap();
    repo.insert_run(&other_session).await.unwrap();
    repo.insert_run(&other_user).await.unwrap();

    repo.mark_completed(older.id, now).await.unwrap();

    let all = repo.list_runs(user(2), &RunFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id(), newer.id);
    assert_eq!(all[2].id(), older.id);

    let completed = repo
        .list_runs(
            user(2),
            &RunFilter {
                status: Some(RunStatus::Completed),
                session_id: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id(), older.id);

    let by_session = repo
        .list_runs(
            user(2),
            &RunFilter {
                status: None,
                session_id: Some(session(9)),
            },
        )
        .await
        .unwrap();
    assert_eq!(by_session.len(), 1);
    assert_eq!(by_session[0].id(), other_session.id);
}

#[tokio::test]
async fn sqlite_concurrent_inserts_yield_one_winner() {
    let repo = connect("memdb_race").await;
    let now = fixed_now();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.insert_run(&record(session(1), user(2), Some("race"), now))
                .await
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => created += 1,
            Err(StorageError::Conflict) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
}
