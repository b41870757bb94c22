//! Event listing and hub health

use crate::api::{ApiError, AppState};
use crate::stream::StreamKind;
use crate::subject::Pattern;
use crate::tenant::Tenant;
use crate::types::Event;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub topic: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListedEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: Event,
}

/// `GET /api/v1/events` - recent events retained on the stream, tenant-scoped
pub async fn list(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ListedEvent>>, ApiError> {
    let filter = match query.topic.as_deref() {
        Some(raw) => {
            let pattern = Pattern::parse(raw)?;
            tenant.event_filter(pattern.as_str())
        }
        None => tenant.event_filter(">"),
    };
    let limit = query.limit.unwrap_or(100).min(1_000);
    let entries = state
        .gateway
        .scan(StreamKind::Events, &filter, limit)
        .await?;

    let events = entries
        .into_iter()
        .filter_map(|entry| {
            serde_json::from_slice::<Event>(&entry.payload)
                .ok()
                .filter(|e| e.org == tenant.org && e.project == tenant.project)
                .map(|event| ListedEvent {
                    sequence: entry.sequence,
                    event,
                })
        })
        .collect();
    Ok(Json(events))
}

/// `GET /api/v1/health` - backend reachability and stream stats
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let healthy = state.gateway.health().await.unwrap_or(false);
    let events = state.gateway.info(StreamKind::Events).await.ok();
    let dlq = state.gateway.info(StreamKind::Dlq).await.ok();

    let stream_stats = |stats: Option<crate::stream::StreamStats>| match stats {
        Some(s) => json!({
            "messages": s.messages,
            "bytes": s.bytes,
            "consumers": s.consumers,
            "last_sequence": s.last_sequence,
        }),
        None => json!(null),
    };

    Ok(Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "backend": state.gateway.name(),
        "events": stream_stats(events),
        "dlq": stream_stats(dlq),
    })))
}
