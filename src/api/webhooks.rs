//! Webhook configuration CRUD and delivery audit

use crate::api::{ApiError, AppState};
use crate::error::HubError;
use crate::store::{DeliveryRecord, Webhook};
use crate::subject::Pattern;
use crate::tenant::Tenant;
use crate::webhook;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub url: String,
    pub topics: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub url: Option<String>,
    pub topics: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

/// Create response: the only place the secret ever appears
#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    #[serde(flatten)]
    pub webhook: Webhook,
    pub secret: String,
}

fn validate_patterns(topics: &[String]) -> Result<(), HubError> {
    if topics.is_empty() {
        return Err(HubError::InvalidPattern {
            pattern: String::new(),
            reason: "at least one topic pattern is required".to_string(),
        });
    }
    for topic in topics {
        Pattern::parse(topic)?;
    }
    Ok(())
}

/// `POST /api/v1/webhooks`
pub async fn create(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<CreateRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    validate_patterns(&body.topics)?;

    let secret = webhook::generate_secret();
    let record = Webhook {
        id: webhook::generate_id(),
        url: body.url,
        topics: body.topics,
        secret: secret.clone(),
        enabled: body.enabled,
        org: tenant.org.clone(),
        project: tenant.project.clone(),
        created_at: Utc::now(),
    };
    state.store.create_webhook(&record).await?;

    tracing::info!(webhook = %record.id, tenant = %tenant, "Webhook created");
    Ok(Json(CreatedResponse {
        webhook: record,
        secret,
    }))
}

/// `GET /api/v1/webhooks`
pub async fn list(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<Vec<Webhook>>, ApiError> {
    Ok(Json(state.store.list_webhooks(&tenant).await?))
}

/// `GET /api/v1/webhooks/:id`
pub async fn fetch(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<Webhook>, ApiError> {
    let webhook = state
        .store
        .get_webhook(&tenant, &id)
        .await?
        .ok_or_else(|| HubError::NotFound(format!("webhook {id}")))?;
    Ok(Json(webhook))
}

/// `PATCH /api/v1/webhooks/:id`
pub async fn update(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRequest>,
) -> Result<Json<Webhook>, ApiError> {
    let mut webhook = state
        .store
        .get_webhook(&tenant, &id)
        .await?
        .ok_or_else(|| HubError::NotFound(format!("webhook {id}")))?;

    if let Some(url) = body.url {
        webhook.url = url;
    }
    if let Some(topics) = body.topics {
        validate_patterns(&topics)?;
        webhook.topics = topics;
    }
    if let Some(enabled) = body.enabled {
        webhook.enabled = enabled;
    }
    state.store.update_webhook(&webhook).await?;
    Ok(Json(webhook))
}

/// `DELETE /api/v1/webhooks/:id`
pub async fn remove(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.store.delete_webhook(&tenant, &id).await?;
    if !deleted {
        return Err(HubError::NotFound(format!("webhook {id}")).into());
    }
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<usize>,
}

/// `GET /api/v1/webhooks/:id/deliveries`
pub async fn deliveries(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    // 404 for unknown or cross-tenant ids
    state
        .store
        .get_webhook(&tenant, &id)
        .await?
        .ok_or_else(|| HubError::NotFound(format!("webhook {id}")))?;

    let limit = query.limit.unwrap_or(100).min(1_000);
    Ok(Json(state.store.list_deliveries(&tenant, &id, limit).await?))
}
