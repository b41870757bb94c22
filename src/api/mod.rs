//! HTTP and WebSocket API surface
//!
//! Routes are thin: they resolve the tenant, call into the core services,
//! and map `HubError` onto status codes. Authorization errors are uniform
//! and cross-tenant lookups surface as 404, never 403.

use crate::config::HubConfig;
use crate::consumer::ConsumerManager;
use crate::dlq::DlqService;
use crate::error::HubError;
use crate::publish::Publisher;
use crate::schedule::SchedulerService;
use crate::store::MetadataStore;
use crate::stream::StreamGateway;
use crate::ws::SessionDeps;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod dlq;
pub mod emit;
pub mod events;
pub mod schedules;
pub mod webhooks;
pub mod ws;

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<Publisher>,
    pub consumers: Arc<ConsumerManager>,
    pub dlq: Arc<DlqService>,
    pub scheduler: Arc<SchedulerService>,
    pub store: Arc<dyn MetadataStore>,
    pub gateway: Arc<dyn StreamGateway>,
    pub session_deps: Arc<SessionDeps>,
    pub shutdown: CancellationToken,
    pub config: Arc<HubConfig>,
}

/// `HubError` with an HTTP rendering
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            HubError::InvalidTopic { .. } => (StatusCode::BAD_REQUEST, "invalid_topic"),
            HubError::InvalidPattern { .. } => (StatusCode::BAD_REQUEST, "invalid_pattern"),
            HubError::Protocol(_) | HubError::Config(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            HubError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            }
            HubError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            HubError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            HubError::ScheduleNotPending { .. } => (StatusCode::CONFLICT, "schedule_not_pending"),
            HubError::Serialization(_) => (StatusCode::BAD_REQUEST, "invalid_body"),
            HubError::BackpressureExceeded => {
                (StatusCode::SERVICE_UNAVAILABLE, "backpressure_exceeded")
            }
            HubError::Connection(_)
            | HubError::StreamUnavailable(_)
            | HubError::Publish { .. }
            | HubError::Consumer(_)
            | HubError::Ack(_)
            | HubError::Store(_)
            | HubError::Delivery(_)
            | HubError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = json!({
            "error": code,
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/v1/emit", post(emit::emit))
        .route("/api/v1/events", get(events::list))
        .route("/api/v1/dlq", get(dlq::list))
        .route("/api/v1/dlq/replay-all", post(dlq::replay_all))
        .route("/api/v1/dlq/purge", delete(dlq::purge))
        .route("/api/v1/dlq/:seq/replay", post(dlq::replay))
        .route("/api/v1/dlq/:seq", delete(dlq::remove))
        .route(
            "/api/v1/webhooks",
            post(webhooks::create).get(webhooks::list),
        )
        .route(
            "/api/v1/webhooks/:id",
            get(webhooks::fetch)
                .patch(webhooks::update)
                .delete(webhooks::remove),
        )
        .route("/api/v1/webhooks/:id/deliveries", get(webhooks::deliveries))
        .route(
            "/api/v1/schedules",
            post(schedules::create).get(schedules::list),
        )
        .route(
            "/api/v1/schedules/:id",
            get(schedules::fetch).delete(schedules::cancel),
        )
        .route("/api/v1/schedules/:id/run", post(schedules::run_now))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_tenant,
        ));

    Router::new()
        .route("/api/v1/health", get(events::health))
        .route("/ws", get(ws::upgrade))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
