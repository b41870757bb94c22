//! `POST /api/v1/emit` - producer entry point

use crate::api::{ApiError, AppState};
use crate::publish::PublishReceipt;
use crate::tenant::Tenant;
use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub topic: String,
    pub data: serde_json::Value,
}

pub async fn emit(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<EmitRequest>,
) -> Result<Json<PublishReceipt>, ApiError> {
    let receipt = state
        .publisher
        .publish(&tenant, &body.topic, body.data)
        .await?;
    Ok(Json(receipt))
}
