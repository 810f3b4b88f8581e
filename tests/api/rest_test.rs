//! REST semantics over a real project (skipped without a `git` binary).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use tower::util::ServiceExt;

use laforge::api::{create_router, ApiState};
use laforge::project::{ProjectRegistry, ProjectStore};
use laforge::repo::GitRepository;

const TOKEN: &str = "t0ken";

/// Build a router over a freshly created project, or `None` without git.
async fn fixture() -> Option<(tempfile::TempDir, axum::Router)> {
    let (dir, router, _registry) = fixture_with_registry().await?;
    Some((dir, router))
}

async fn fixture_with_registry(
) -> Option<(tempfile::TempDir, axum::Router, Arc<ProjectRegistry>)> {
    if !GitRepository::git_available().await {
        return None;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ProjectStore::new(dir.path().to_path_buf());
    let repo = GitRepository::new(Duration::from_secs(30));
    store
        .create("demo", "Demo", "test project", &repo)
        .await
        .expect("create project");

    let registry = Arc::new(ProjectRegistry::new(store));
    let state = ApiState {
        registry: Arc::clone(&registry),
        auth_token: Some(TOKEN.to_owned()),
        subscriber_idle: Duration::from_secs(300),
    };
    Some((dir, create_router(state, Duration::from_secs(5)), registry))
}

fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TOKEN}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn task_crud_round_trip() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };

    // Create.
    let response = router
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/v1/projects/demo/tasks",
            Some(serde_json::json!({"title": "build the parser", "task_type": "FEAT"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["data"]["title"], "build the parser");
    assert_eq!(created["data"]["status"], "todo");
    let id = created["data"]["id"].as_i64().expect("id");

    // Read with expansion flags.
    let response = router
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/api/v1/projects/demo/tasks/{id}?include_logs=true&include_reviews=true"),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert!(fetched["data"]["logs"].is_array());
    assert!(fetched["data"]["reviews"].is_array());

    // Status update.
    let response = router
        .clone()
        .oneshot(request(
            Method::PUT,
            &format!("/api/v1/projects/demo/tasks/{id}/status"),
            Some(serde_json::json!({"status": "in-progress"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // Comma-list status filter matches any.
    let response = router
        .clone()
        .oneshot(request(
            Method::GET,
            "/api/v1/projects/demo/tasks?status=in-progress,completed",
            None,
        ))
        .await
        .expect("response");
    let listed = body_json(response).await;
    assert_eq!(listed["data"].as_array().expect("array").len(), 1);

    // Delete.
    let response = router
        .clone()
        .oneshot(request(
            Method::DELETE,
            &format!("/api/v1/projects/demo/tasks/{id}"),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(request(
            Method::GET,
            &format!("/api/v1/projects/demo/tasks/{id}"),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_status_filter_is_a_validation_error() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let response = router
        .oneshot(request(
            Method::GET,
            "/api/v1/projects/demo/tasks?status=bogus",
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn invariant_violations_surface_as_validation_errors() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let parent = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/projects/demo/tasks",
                Some(serde_json::json!({"title": "parent"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("id");
    router
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/v1/projects/demo/tasks",
            Some(serde_json::json!({"title": "child", "parent_id": parent})),
        ))
        .await
        .expect("response");

    let response = router
        .oneshot(request(
            Method::PUT,
            &format!("/api/v1/projects/demo/tasks/{parent}/status"),
            Some(serde_json::json!({"status": "completed"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    assert!(json["error"]["message"]
        .as_str()
        .expect("message")
        .contains("child"));
}

#[tokio::test]
async fn next_returns_null_with_a_message_when_idle() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let response = router
        .oneshot(request(Method::GET, "/api/v1/projects/demo/tasks/next", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["data"].is_null());
    assert!(json["meta"]["message"].is_string());
}

#[tokio::test]
async fn queue_endpoints_feed_next() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let id = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/projects/demo/tasks",
                Some(serde_json::json!({"title": "queued work"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("id");

    router
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/api/v1/projects/demo/tasks/{id}/enqueue"),
            None,
        ))
        .await
        .expect("response");

    let json = body_json(
        router
            .clone()
            .oneshot(request(Method::GET, "/api/v1/projects/demo/tasks/next", None))
            .await
            .expect("response"),
    )
    .await;
    assert_eq!(json["data"]["id"], id);

    router
        .clone()
        .oneshot(request(
            Method::DELETE,
            &format!("/api/v1/projects/demo/tasks/{id}/enqueue"),
            None,
        ))
        .await
        .expect("response");
    let json = body_json(
        router
            .oneshot(request(Method::GET, "/api/v1/projects/demo/tasks/next", None))
            .await
            .expect("response"),
    )
    .await;
    assert!(json["data"].is_null());
}

#[tokio::test]
async fn review_feedback_applies_plan_documents() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };

    // Write a plan document into the project's source tree.
    let state_dir = _dir.path().join("projects").join("demo").join("source");
    std::fs::write(
        state_dir.join("roadmap.plan.json"),
        serde_json::json!({
            "tasks": [
                {"title": "from the plan", "task_type": "PLAN"},
                {"title": "also from the plan"}
            ]
        })
        .to_string(),
    )
    .expect("write plan");

    let task_id = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/projects/demo/tasks",
                Some(serde_json::json!({"title": "plan holder", "task_type": "PLAN"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("id");

    let review = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/api/v1/projects/demo/tasks/{task_id}/reviews"),
                Some(serde_json::json!({
                    "message": "please approve the roadmap",
                    "attachment_path": "roadmap.plan.json"
                })),
            ))
            .await
            .expect("response"),
    )
    .await;
    let review_id = review["data"]["id"].as_i64().expect("review id");

    let response = router
        .clone()
        .oneshot(request(
            Method::PUT,
            &format!("/api/v1/projects/demo/reviews/{review_id}/feedback"),
            Some(serde_json::json!({"status": "approved"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(
        json["data"]["plan_applied_task_ids"]
            .as_array()
            .expect("applied ids")
            .len(),
        2
    );

    // The plan's tasks now exist.
    let listed = body_json(
        router
            .oneshot(request(Method::GET, "/api/v1/projects/demo/tasks", None))
            .await
            .expect("response"),
    )
    .await;
    assert_eq!(listed["data"].as_array().expect("array").len(), 3);
}

#[tokio::test]
async fn rejected_feedback_without_text_is_invalid() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let task_id = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/projects/demo/tasks",
                Some(serde_json::json!({"title": "t"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("id");
    let review_id = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/api/v1/projects/demo/tasks/{task_id}/reviews"),
                Some(serde_json::json!({"message": "check"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("review id");

    let response = router
        .oneshot(request(
            Method::PUT,
            &format!("/api/v1/projects/demo/reviews/{review_id}/feedback"),
            Some(serde_json::json!({"status": "rejected"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mutations_reach_subscribers_on_their_channels() {
    let Some((_dir, router, registry)) = fixture_with_registry().await else {
        return;
    };
    use laforge::events::{Channel, Event};

    let handle = registry.open("demo").await.expect("open handle");
    let (_sub, mut rx) = handle.hub.subscribe(vec![Channel::Tasks, Channel::Reviews]);
    let (_steps_sub, mut steps_rx) = handle.hub.subscribe(vec![Channel::Steps]);

    // Create a task: one task_updated.
    let task_id = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/projects/demo/tasks",
                Some(serde_json::json!({"title": "watched"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("id");
    assert!(matches!(rx.try_recv(), Ok(Event::TaskUpdated(_))));

    // Create a review: task_updated (now in-review) then review_updated.
    let review_id = body_json(
        router
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/api/v1/projects/demo/tasks/{task_id}/reviews"),
                Some(serde_json::json!({"message": "look"})),
            ))
            .await
            .expect("response"),
    )
    .await["data"]["id"]
        .as_i64()
        .expect("review id");
    match rx.try_recv() {
        Ok(Event::TaskUpdated(event)) => {
            assert_eq!(
                event.status,
                Some(laforge::store::TaskStatus::InReview)
            );
        }
        other => panic!("unexpected delivery: {other:?}"),
    }
    assert!(matches!(rx.try_recv(), Ok(Event::ReviewUpdated(_))));

    // Approved feedback: one review_updated.
    router
        .oneshot(request(
            Method::PUT,
            &format!("/api/v1/projects/demo/reviews/{review_id}/feedback"),
            Some(serde_json::json!({"status": "approved"})),
        ))
        .await
        .expect("response");
    assert!(matches!(rx.try_recv(), Ok(Event::ReviewUpdated(_))));
    assert!(rx.try_recv().is_err());

    // The steps channel saw none of it.
    assert!(steps_rx.try_recv().is_err());
}

#[tokio::test]
async fn steps_listing_is_empty_for_a_fresh_project() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let response = router
        .oneshot(request(Method::GET, "/api/v1/projects/demo/steps", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().expect("array").len(), 0);
}

#[tokio::test]
async fn unknown_project_is_not_found() {
    let Some((_dir, router)) = fixture().await else {
        return;
    };
    let response = router
        .oneshot(request(Method::GET, "/api/v1/projects/ghost/tasks", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}
