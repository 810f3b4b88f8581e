//! Bearer-token auth for API routes.
//!
//! Deny-by-default: with no token configured, every request is rejected.
//! Token issuance is out of scope; the configured token is compared
//! directly. Live-update connections authenticate separately via a query
//! parameter (browsers cannot set headers on WebSocket upgrades).

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::error::ApiError;
use super::ApiState;

/// Middleware requiring a valid `Authorization: Bearer <token>` header.
///
/// # Errors
///
/// Returns 403 when auth is not configured, 401 for a missing or wrong
/// token.
pub async fn require_auth(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state
        .auth_token
        .as_deref()
        .ok_or_else(|| ApiError::forbidden("authentication not configured; access denied"))?;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("invalid Authorization header format"))?;

    if !token_matches(token, expected) {
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(next.run(req).await)
}

/// Validate a token presented via query parameter (WebSocket upgrade).
///
/// # Errors
///
/// Returns 403 when auth is not configured, 401 for a missing or wrong
/// token.
pub fn check_query_token(state: &ApiState, token: Option<&str>) -> Result<(), ApiError> {
    let expected = state
        .auth_token
        .as_deref()
        .ok_or_else(|| ApiError::forbidden("authentication not configured; access denied"))?;
    let token = token.ok_or_else(|| ApiError::unauthorized("missing token query parameter"))?;
    if !token_matches(token, expected) {
        return Err(ApiError::unauthorized("invalid token"));
    }
    Ok(())
}

/// Constant-time-ish comparison; length leaks, contents do not.
fn token_matches(given: &str, expected: &str) -> bool {
    if given.len() != expected.len() {
        return false;
    }
    given
        .bytes()
        .zip(expected.bytes())
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
