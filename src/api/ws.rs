//! Live-update WebSocket endpoint.
//!
//! Protocol:
//! 1. Client connects to `/api/v1/projects/{id}/events?token=...`
//!    (query-parameter auth; browsers cannot set upgrade headers)
//! 2. Client sends `{"type": "subscribe", "channels": ["tasks", ...]}`
//! 3. Server streams `{"type": ..., "data": {...}}` events for the chosen
//!    channels until the client disconnects or falls too far behind

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, warn};

use super::auth::check_query_token;
use super::ApiState;
use crate::events::Channel;
use crate::project::ProjectHandle;

/// Budget for the client to send its subscribe message.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameters on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token equivalent.
    pub token: Option<String>,
}

/// Expected first message from the client.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscribeMessage {
    /// Must be `"subscribe"`.
    #[serde(rename = "type")]
    msg_type: String,
    /// Channels to receive.
    channels: Vec<Channel>,
}

/// WebSocket upgrade handler for `/projects/{project_id}/events`.
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(project_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    if let Err(e) = check_query_token(&state, query.token.as_deref()) {
        return e.into_response();
    }
    let handle = match state.registry.open(&project_id).await {
        Ok(handle) => handle,
        Err(e) => return super::ApiError::from(e).into_response(),
    };
    let idle = state.subscriber_idle;
    ws.on_upgrade(move |socket| handle_ws(socket, handle, idle))
}

async fn handle_ws(mut socket: WebSocket, handle: Arc<ProjectHandle>, idle: Duration) {
    let Some(channels) = await_subscribe(&mut socket).await else {
        return;
    };

    let (id, mut rx) = handle.hub.subscribe(channels);
    debug!(project = %handle.project.id, subscriber = ?id, "live-update subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let mut idle_ping = interval(idle);
    idle_ping.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize event");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Outbox was dropped by the hub (overflow); the client
                    // must reconnect to resynchronize.
                    None => break,
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = idle_ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    handle.hub.unsubscribe(id);
    debug!(project = %handle.project.id, subscriber = ?id, "live-update subscriber disconnected");
}

/// Wait for a valid subscribe message; `None` closes the connection.
async fn await_subscribe(socket: &mut WebSocket) -> Option<Vec<Channel>> {
    let first = match timeout(SUBSCRIBE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
        Ok(_) => {
            debug!("client closed or sent a non-text frame before subscribing");
            return None;
        }
        Err(_) => {
            debug!("client did not subscribe in time");
            return None;
        }
    };

    match serde_json::from_str::<SubscribeMessage>(&first) {
        Ok(message) if message.msg_type == "subscribe" && !message.channels.is_empty() => {
            Some(message.channels)
        }
        Ok(_) => {
            let _ = socket
                .send(Message::Text(
                    r#"{"error": "expected a subscribe message with at least one channel"}"#.into(),
                ))
                .await;
            None
        }
        Err(e) => {
            let _ = socket
                .send(Message::Text(
                    format!(r#"{{"error": "invalid subscribe message: {e}"}}"#).into(),
                ))
                .await;
            None
        }
    }
}
