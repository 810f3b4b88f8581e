//! Projection service: the read/write HTTP API and live-update WebSocket.
//!
//! Versioned under `/api/v1`. Every payload is wrapped in
//! `{"data": ..., "meta": {"timestamp", "version"}}`; errors follow the
//! envelope in [`error`].

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::HarnessConfig;
use crate::project::ProjectRegistry;

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ws;

pub use error::{ApiError, ApiResult, ErrorCode};

/// API version reported in every response envelope.
pub const API_VERSION: &str = "v1";

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Open-project registry.
    pub registry: Arc<ProjectRegistry>,
    /// Configured bearer token; `None` rejects everything.
    pub auth_token: Option<String>,
    /// Idle budget before a silent subscriber gets pinged and dropped.
    pub subscriber_idle: Duration,
}

impl ApiState {
    /// Build state from the harness config.
    pub fn new(registry: Arc<ProjectRegistry>, config: &HarnessConfig) -> Self {
        Self {
            registry,
            auth_token: config.api.auth_token.clone(),
            subscriber_idle: Duration::from_secs(config.timeouts.subscriber_idle_secs),
        }
    }
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState").finish_non_exhaustive()
    }
}

/// Response metadata object.
pub(crate) fn meta() -> serde_json::Value {
    serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": API_VERSION,
    })
}

/// Wrap `data` in the standard envelope.
pub(crate) fn envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "data": data, "meta": meta() }))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, envelope(serde_json::json!({"status": "ok"})))
}

/// Build the full router.
pub fn create_router(state: ApiState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let authed = Router::new()
        .route("/projects", get(handlers::list_projects))
        .route(
            "/projects/{project_id}/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route("/projects/{project_id}/tasks/next", get(handlers::next_task))
        .route(
            "/projects/{project_id}/tasks/{task_id}",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route(
            "/projects/{project_id}/tasks/{task_id}/status",
            put(handlers::update_task_status),
        )
        .route(
            "/projects/{project_id}/tasks/{task_id}/logs",
            get(handlers::list_task_logs).post(handlers::append_task_log),
        )
        .route(
            "/projects/{project_id}/tasks/{task_id}/reviews",
            get(handlers::list_task_reviews).post(handlers::create_task_review),
        )
        .route(
            "/projects/{project_id}/tasks/{task_id}/enqueue",
            post(handlers::enqueue_task).delete(handlers::dequeue_task),
        )
        .route(
            "/projects/{project_id}/reviews/{review_id}",
            get(handlers::get_review),
        )
        .route(
            "/projects/{project_id}/reviews/{review_id}/feedback",
            put(handlers::set_review_feedback),
        )
        .route("/projects/{project_id}/steps", get(handlers::list_steps))
        .route(
            "/projects/{project_id}/steps/{step_id}",
            get(handlers::get_step),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        // The request timeout covers REST handlers only; the live-update
        // socket below manages its own idle budget.
        .layer(TimeoutLayer::new(request_timeout));

    let live = Router::new().route("/projects/{project_id}/events", get(ws::ws_events));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", authed.merge(live))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the API until the process exits.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(
    state: ApiState,
    bind_addr: &str,
    request_timeout: Duration,
) -> anyhow::Result<()> {
    let router = create_router(state, request_timeout);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "projection service listening");
    axum::serve(listener, router).await?;
    Ok(())
}
