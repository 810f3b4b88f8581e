//! Rollback scenarios.

use std::sync::Arc;

use laforge::error::CoreError;
use laforge::events::{Channel, Event, RollbackEvent};
use laforge::project::{Project, ProjectHandle, ProjectPaths};
use laforge::step::rollback;
use laforge::store::{StepStore, TaskFilter, TaskStore};

use super::fakes::FakeRepository;

async fn fixture(dir: &std::path::Path) -> Arc<ProjectHandle> {
    let paths = ProjectPaths::new(dir, "demo");
    std::fs::create_dir_all(&paths.root).expect("root");
    std::fs::create_dir_all(&paths.source_root).expect("source");
    let tasks = TaskStore::open(&paths.tasks_db).await.expect("tasks");
    let steps = StepStore::open(&paths.steps_db).await.expect("steps");
    Arc::new(
        ProjectHandle::new_for_test(
            Project {
                id: "demo".into(),
                name: "Demo".into(),
                description: String::new(),
            },
            paths,
            tasks,
            steps,
        )
        .expect("handle"),
    )
}

/// Record three finished steps c0 -> c1 -> c2 -> c3.
async fn three_steps(handle: &ProjectHandle) -> Vec<i64> {
    let mut ids = Vec::new();
    for i in 0..3_i64 {
        let step = handle
            .steps
            .begin_step(
                "demo",
                ids.last().copied(),
                &format!("c{i}"),
                &serde_json::json!({}),
            )
            .await
            .expect("begin");
        handle
            .steps
            .finish_step(step.id, Some(&format!("c{}", i.saturating_add(1))), 0, None)
            .await
            .expect("finish");
        ids.push(step.id);
    }
    ids
}

#[tokio::test]
async fn rollback_deactivates_suffix_and_resets_head() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = fixture(dir.path()).await;
    let repo = FakeRepository::new("c3");
    let ids = three_steps(&handle).await;

    // Task data must survive rollback untouched.
    let task_id = handle.tasks.add("keep me", None).await.expect("add");

    let (_sub, mut rx) = handle.hub.subscribe(vec![Channel::Steps]);

    let deactivated = rollback(&handle, repo.as_ref(), ids[1])
        .await
        .expect("rollback");
    assert_eq!(deactivated, vec![ids[1], ids[2]]);

    // HEAD is step 2's commit_before.
    assert_eq!(repo.head(), "c1");

    let s2 = handle.steps.get(ids[1]).await.expect("s2");
    let s3 = handle.steps.get(ids[2]).await.expect("s3");
    assert!(!s2.active && !s3.active);
    let s1 = handle.steps.get(ids[0]).await.expect("s1");
    assert!(s1.active);

    // One rollback event naming the range.
    match rx.try_recv() {
        Ok(Event::StepsRolledBack(RollbackEvent {
            target_step_id,
            deactivated,
        })) => {
            assert_eq!(target_step_id, ids[1]);
            assert_eq!(deactivated, vec![ids[1], ids[2]]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Tasks untouched.
    let tasks = handle.tasks.list(&TaskFilter::default()).await.expect("list");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task_id);
}

#[tokio::test]
async fn rollback_is_rejected_on_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = fixture(dir.path()).await;
    let repo = FakeRepository::new("c3");
    let ids = three_steps(&handle).await;

    rollback(&handle, repo.as_ref(), ids[1])
        .await
        .expect("first rollback");
    let resets_after_first = repo.state.lock().expect("state").reset_to.len();

    let err = rollback(&handle, repo.as_ref(), ids[1])
        .await
        .expect_err("replay must be rejected");
    assert!(matches!(err, CoreError::Conflict(_)));

    // No further repository mutation happened.
    assert_eq!(
        repo.state.lock().expect("state").reset_to.len(),
        resets_after_first
    );
}

#[tokio::test]
async fn rollback_requires_an_existing_active_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = fixture(dir.path()).await;
    let repo = FakeRepository::new("c0");

    let err = rollback(&handle, repo.as_ref(), 42)
        .await
        .expect_err("missing step");
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn rollback_refuses_while_a_step_is_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = fixture(dir.path()).await;
    let repo = FakeRepository::new("c1");

    let first = handle
        .steps
        .begin_step("demo", None, "c0", &serde_json::json!({}))
        .await
        .expect("begin");
    handle
        .steps
        .finish_step(first.id, Some("c1"), 0, None)
        .await
        .expect("finish");
    handle
        .steps
        .begin_step("demo", Some(first.id), "c1", &serde_json::json!({}))
        .await
        .expect("begin running step");

    let err = rollback(&handle, repo.as_ref(), first.id)
        .await
        .expect_err("running step must block rollback");
    assert!(matches!(err, CoreError::Conflict(_)));
}
