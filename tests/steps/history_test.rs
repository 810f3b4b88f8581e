//! Step history invariants: id monotonicity, single running step,
//! suffix deactivation.

use laforge::error::CoreError;
use laforge::store::{StepFilter, StepStore};

const PROJECT: &str = "demo";

async fn store() -> StepStore {
    StepStore::open_in_memory()
        .await
        .expect("in-memory store should open")
}

fn config() -> serde_json::Value {
    serde_json::json!({"image": "agent:test"})
}

#[tokio::test]
async fn ids_increase_and_parents_link() {
    let store = store().await;
    let s1 = store
        .begin_step(PROJECT, None, "c0", &config())
        .await
        .expect("begin s1");
    store
        .finish_step(s1.id, Some("c1"), 0, None)
        .await
        .expect("finish s1");

    let parent = store
        .latest_active(PROJECT)
        .await
        .expect("latest")
        .expect("s1 active");
    let s2 = store
        .begin_step(PROJECT, Some(parent.id), "c1", &config())
        .await
        .expect("begin s2");

    assert!(s2.id > s1.id);
    assert_eq!(s2.parent_step_id, Some(s1.id));
    assert_eq!(s2.commit_before, "c1");
    assert!(s2.active);
}

#[tokio::test]
async fn only_one_step_may_run_at_a_time() {
    let store = store().await;
    store
        .begin_step(PROJECT, None, "c0", &config())
        .await
        .expect("begin");

    let err = store
        .begin_step(PROJECT, None, "c0", &config())
        .await
        .expect_err("second running step must be rejected");
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn parent_must_exist_in_the_same_project() {
    let store = store().await;
    let err = store
        .begin_step(PROJECT, Some(42), "c0", &config())
        .await
        .expect_err("dangling parent");
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn finish_records_duration_and_usage() {
    let store = store().await;
    let step = store
        .begin_step(PROJECT, None, "c0", &config())
        .await
        .expect("begin");
    let usage = serde_json::json!({"input_tokens": 100, "output_tokens": 50});
    let finished = store
        .finish_step(step.id, Some("c1"), 0, Some(&usage))
        .await
        .expect("finish");

    assert!(!finished.is_running());
    assert_eq!(finished.commit_after.as_deref(), Some("c1"));
    assert_eq!(finished.exit_code, Some(0));
    assert!(finished.duration_ms.is_some_and(|ms| ms >= 0));
    assert_eq!(finished.token_usage, Some(usage));

    let err = store
        .finish_step(step.id, Some("c2"), 0, None)
        .await
        .expect_err("double finish");
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn failed_steps_keep_commit_after_unset() {
    let store = store().await;
    let step = store
        .begin_step(PROJECT, None, "c0", &config())
        .await
        .expect("begin");
    let failed = store.fail_step(step.id, -1).await.expect("fail");
    assert_eq!(failed.commit_after, None);
    assert_eq!(failed.exit_code, Some(-1));
}

#[tokio::test]
async fn deactivate_from_flips_a_suffix_in_one_shot() {
    let store = store().await;
    let mut ids = Vec::new();
    for i in 0..3_i64 {
        let step = store
            .begin_step(PROJECT, None, &format!("c{i}"), &config())
            .await
            .expect("begin");
        store
            .finish_step(step.id, Some(&format!("c{}", i.saturating_add(1))), 0, None)
            .await
            .expect("finish");
        ids.push(step.id);
    }

    let deactivated = store
        .deactivate_from(PROJECT, ids[1])
        .await
        .expect("deactivate");
    assert_eq!(deactivated, vec![ids[1], ids[2]]);

    let latest = store
        .latest_active(PROJECT)
        .await
        .expect("latest")
        .expect("first still active");
    assert_eq!(latest.id, ids[0]);

    let inactive = store
        .list(
            PROJECT,
            &StepFilter {
                active: Some(false),
                ..StepFilter::default()
            },
        )
        .await
        .expect("list inactive");
    assert_eq!(inactive.len(), 2);
}

#[tokio::test]
async fn listing_is_scoped_by_project() {
    let store = store().await;
    let step = store
        .begin_step(PROJECT, None, "c0", &config())
        .await
        .expect("begin");
    store
        .finish_step(step.id, None, 0, None)
        .await
        .expect("finish");
    store
        .begin_step("other", None, "x0", &config())
        .await
        .expect("begin other project");

    let steps = store
        .list(PROJECT, &StepFilter::default())
        .await
        .expect("list");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].project_id, PROJECT);
}
