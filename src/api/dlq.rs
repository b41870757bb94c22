//! DLQ management routes

use crate::api::{ApiError, AppState};
use crate::tenant::Tenant;
use crate::types::DlqEntry;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub topic: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/v1/dlq`
pub async fn list(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<Vec<DlqEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(1_000);
    let entries = state
        .dlq
        .list(&tenant, query.topic.as_deref(), limit)
        .await?;
    Ok(Json(entries))
}

/// `POST /api/v1/dlq/:seq/replay`
pub async fn replay(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(seq): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event = state.dlq.replay(&tenant, seq).await?;
    Ok(Json(json!({
        "replayed": seq,
        "event_id": event.id,
        "topic": event.topic,
    })))
}

/// `DELETE /api/v1/dlq/:seq`
pub async fn remove(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(seq): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.dlq.delete(&tenant, seq).await?;
    Ok(Json(json!({ "deleted": seq })))
}

/// `POST /api/v1/dlq/replay-all?topic=`
pub async fn replay_all(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let replayed = state
        .dlq
        .replay_all(&tenant, query.topic.as_deref())
        .await?;
    Ok(Json(json!({ "replayed": replayed })))
}

/// `DELETE /api/v1/dlq/purge?topic=`
pub async fn purge(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let purged = state.dlq.purge(&tenant, query.topic.as_deref()).await?;
    Ok(Json(json!({ "purged": purged })))
}
