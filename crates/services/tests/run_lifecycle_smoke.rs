use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use runs_core::model::{Caller, RunStatus, SessionId, UserId};
use runs_core::time::fixed_clock;
use services::{AppServices, ProgressUpdate, RunServiceError, StaticSessionDirectory};

fn setup() -> (AppServices, SessionId, Caller) {
    let session_id = SessionId::new(Uuid::from_u128(1));
    let directory = StaticSessionDirectory::new();
    directory.insert(session_id);

    let services = AppServices::in_memory(fixed_clock(), Arc::new(directory));
    let caller = Caller::User(UserId::new(Uuid::from_u128(2)));
    (services, session_id, caller)
}

#[tokio::test]
async fn run_lifecycle_end_to_end() {
    let (services, session_id, caller) = setup();
    let svc = services.run_lifecycle();

    // Start under a key, then replay the same start.
    let first = svc
        .start(&caller, session_id, Some("k1".into()))
        .await
        .unwrap();
    assert!(first.created);
    assert_eq!(first.run.status(), RunStatus::Active);

    let replay = svc
        .start(&caller, session_id, Some("k1".into()))
        .await
        .unwrap();
    assert!(!replay.created);
    assert_eq!(replay.run.id(), first.run.id());

    let run_id = first.run.id();

    // Progress forward, then a stale write that must bounce.
    let run = svc
        .save_progress(
            &caller,
            run_id,
            ProgressUpdate {
                step_index: Some(3),
                payload: Some(json!({"answers": [true, false, true]})),
            },
        )
        .await
        .unwrap();
    assert_eq!(run.current_step_index(), 3);

    let err = svc
        .save_progress(
            &caller,
            run_id,
            ProgressUpdate {
                step_index: Some(1),
                payload: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RunServiceError::StaleProgress { .. }));
    assert_eq!(
        svc.fetch(&caller, run_id).await.unwrap().current_step_index(),
        3
    );

    // A check-in and an activity while the run is open.
    svc.create_checkin(&caller, run_id, json!({"confidence": 4}))
        .await
        .unwrap();
    svc.create_activity(&caller, run_id, json!({"kind": "answer", "step": 3}))
        .await
        .unwrap();

    // Complete, then verify the terminal contract.
    let done = svc.complete(&caller, run_id).await.unwrap();
    assert_eq!(done.status(), RunStatus::Completed);
    let completed_at = done.completed_at().unwrap();

    let err = svc.abandon(&caller, run_id, None).await.unwrap_err();
    assert!(matches!(
        err,
        RunServiceError::InvalidTransition {
            from: RunStatus::Completed
        }
    ));

    let again = svc.complete(&caller, run_id).await.unwrap();
    assert_eq!(again.completed_at(), Some(completed_at));

    let err = svc
        .create_checkin(&caller, run_id, json!({"confidence": 5}))
        .await
        .unwrap_err();
    assert!(matches!(err, RunServiceError::RunClosed));

    // The appended records survive completion, readable as before.
    assert_eq!(svc.list_checkins(&caller, run_id).await.unwrap().len(), 1);
    assert_eq!(svc.list_activities(&caller, run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_starts_converge_on_one_run() {
    let (services, session_id, caller) = setup();
    let svc = services.run_lifecycle();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let svc = Arc::clone(&svc);
        handles.push(tokio::spawn(async move {
            svc.start(&caller, session_id, Some("race".into())).await
        }));
    }

    let mut created = 0;
    let mut run_ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.created {
            created += 1;
        }
        run_ids.push(outcome.run.id());
    }

    assert_eq!(created, 1);
    run_ids.dedup();
    assert_eq!(run_ids.len(), 1);
}
