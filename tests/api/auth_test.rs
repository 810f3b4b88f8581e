//! Bearer-token auth behavior.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use laforge::api::{create_router, ApiState};
use laforge::project::{ProjectRegistry, ProjectStore};

fn state(token: Option<&str>) -> ApiState {
    let dir = std::env::temp_dir().join(format!("laforge-auth-{}", std::process::id()));
    ApiState {
        registry: Arc::new(ProjectRegistry::new(ProjectStore::new(dir))),
        auth_token: token.map(ToOwned::to_owned),
        subscriber_idle: Duration::from_secs(300),
    }
}

fn router(token: Option<&str>) -> axum::Router {
    create_router(state(token), Duration::from_secs(5))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_needs_no_auth() {
    let response = router(Some("secret"))
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "ok");
    assert_eq!(json["meta"]["version"], "v1");
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let response = router(Some("secret"))
        .oneshot(
            Request::builder()
                .uri("/api/v1/projects")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let response = router(Some("secret"))
        .oneshot(
            Request::builder()
                .uri("/api/v1/projects")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unconfigured_auth_denies_everything() {
    let response = router(None)
        .oneshot(
            Request::builder()
                .uri("/api/v1/projects")
                .header("authorization", "Bearer anything")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn valid_token_passes() {
    let response = router(Some("secret"))
        .oneshot(
            Request::builder()
                .uri("/api/v1/projects")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["data"].is_array());
}
