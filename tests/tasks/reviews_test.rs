//! Review lifecycle and review-gate tests.

use laforge::error::CoreError;
use laforge::store::{NewTask, ReviewStatus, TaskStatus, TaskStore};

async fn store() -> TaskStore {
    TaskStore::open_in_memory()
        .await
        .expect("in-memory store should open")
}

#[tokio::test]
async fn review_required_gate_runs_the_full_lifecycle() {
    let store = store().await;
    let t1 = store
        .add_with_details(NewTask {
            title: "guarded".into(),
            review_required: true,
            ..NewTask::default()
        })
        .await
        .expect("add");

    // No review yet: completion blocked by the approval requirement.
    let err = store
        .update_status(t1, TaskStatus::Completed)
        .await
        .expect_err("approval requirement should block");
    assert!(matches!(err, CoreError::Invariant(_)));

    // Creating a review flips the task to in-review atomically.
    let review = store
        .create_review(t1, "please check", None)
        .await
        .expect("create review");
    assert_eq!(review.status, ReviewStatus::Pending);
    let task = store.get_required(t1).await.expect("get");
    assert_eq!(task.status, TaskStatus::InReview);

    // Pending review still blocks completion.
    let err = store
        .update_status(t1, TaskStatus::Completed)
        .await
        .expect_err("pending review should block");
    assert!(matches!(err, CoreError::Invariant(_)));

    // Approval unblocks it.
    let outcome = store
        .set_review_feedback(review.id, ReviewStatus::Approved, Some("looks right"))
        .await
        .expect("feedback");
    assert!(outcome.newly_approved);
    store
        .update_status(t1, TaskStatus::Completed)
        .await
        .expect("completion after approval");
}

#[tokio::test]
async fn rejected_feedback_requires_a_message() {
    let store = store().await;
    let t1 = store.add("t", None).await.expect("add");
    let review = store
        .create_review(t1, "check", None)
        .await
        .expect("review");

    let err = store
        .set_review_feedback(review.id, ReviewStatus::Rejected, None)
        .await
        .expect_err("empty rejection feedback should fail");
    assert!(matches!(err, CoreError::Validation(_)));

    let err = store
        .set_review_feedback(review.id, ReviewStatus::Rejected, Some("  "))
        .await
        .expect_err("blank rejection feedback should fail");
    assert!(matches!(err, CoreError::Validation(_)));

    store
        .set_review_feedback(review.id, ReviewStatus::Rejected, Some("needs work"))
        .await
        .expect("rejection with feedback");
}

#[tokio::test]
async fn feedback_replay_is_idempotent() {
    let store = store().await;
    let t1 = store.add("t", None).await.expect("add");
    let review = store
        .create_review(t1, "check", None)
        .await
        .expect("review");

    let first = store
        .set_review_feedback(review.id, ReviewStatus::Approved, None)
        .await
        .expect("first feedback");
    assert!(first.newly_approved);

    let replay = store
        .set_review_feedback(review.id, ReviewStatus::Approved, None)
        .await
        .expect("replayed feedback");
    assert!(!replay.newly_approved);
    assert_eq!(replay.review.status, ReviewStatus::Approved);
    assert_eq!(replay.review.feedback, first.review.feedback);
}

#[tokio::test]
async fn pending_verdict_is_rejected() {
    let store = store().await;
    let t1 = store.add("t", None).await.expect("add");
    let review = store
        .create_review(t1, "check", None)
        .await
        .expect("review");
    let err = store
        .set_review_feedback(review.id, ReviewStatus::Pending, None)
        .await
        .expect_err("pending verdict is not feedback");
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn feedback_on_missing_review_is_not_found() {
    let store = store().await;
    let err = store
        .set_review_feedback(42, ReviewStatus::Approved, None)
        .await
        .expect_err("missing review");
    assert!(matches!(err, CoreError::NotFound { .. }));
}
