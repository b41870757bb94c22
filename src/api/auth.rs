//! API-key authentication
//!
//! Keys arrive as `Authorization: Bearer <key>` (or `?token=` on the
//! WebSocket upgrade), are hashed, and resolve to a tenant through the key
//! store. Every failure is a uniform 401 so key validity never leaks.

use crate::api::{ApiError, AppState};
use crate::error::HubError;
use crate::tenant::Tenant;
use axum::extract::{Query, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex of a presented key; only hashes are stored or compared
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Pull the bearer token out of an Authorization header value
fn bearer(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve a tenant from a raw key
pub async fn resolve_key(state: &AppState, key: &str) -> Result<Tenant, HubError> {
    state
        .store
        .resolve(&hash_key(key))
        .await?
        .ok_or(HubError::Unauthorized)
}

/// Middleware: require a valid API key and stash the tenant as an extension
pub async fn require_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer)
        .ok_or(HubError::Unauthorized)?
        .to_string();

    let tenant = resolve_key(&state, &key).await?;
    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Tenant resolution for the WebSocket upgrade: bearer header or `?token=`
pub async fn resolve_ws_tenant(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    query: &Query<TokenQuery>,
) -> Result<Tenant, HubError> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer);
    let key = from_header
        .or(query.token.as_deref())
        .ok_or(HubError::Unauthorized)?;
    resolve_key(state, key).await
}
