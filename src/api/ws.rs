//! WebSocket upgrade endpoint

use crate::api::auth::{resolve_ws_tenant, TokenQuery};
use crate::api::{ApiError, AppState};
use crate::ws::session;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;

/// `GET /ws` - authenticate, then hand the socket to a session
pub async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = resolve_ws_tenant(&state, &headers, &query).await?;
    let deps = state.session_deps.clone();
    let shutdown = state.shutdown.clone();
    Ok(ws.on_upgrade(move |socket| session::run(socket, tenant, deps, shutdown)))
}
