//! Schedule routes

use crate::api::{ApiError, AppState};
use crate::error::HubError;
use crate::schedule::ScheduleAt;
use crate::store::{Schedule, ScheduleStatus};
use crate::tenant::Tenant;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub topic: String,
    pub data: serde_json::Value,

    /// RFC3339 instant; exclusive with `in`
    pub scheduled_for: Option<String>,

    /// Relative offset like "30m"; exclusive with `scheduled_for`
    #[serde(rename = "in")]
    pub offset: Option<String>,
}

fn parse_when(body: &CreateRequest) -> Result<ScheduleAt, HubError> {
    match (&body.scheduled_for, &body.offset) {
        (Some(at), None) => {
            let parsed = DateTime::parse_from_rfc3339(at).map_err(|e| {
                HubError::Config(format!("invalid scheduled_for '{at}': {e}"))
            })?;
            Ok(ScheduleAt::At(parsed.with_timezone(&Utc)))
        }
        (None, Some(offset)) => {
            let duration = humantime::parse_duration(offset)
                .map_err(|e| HubError::Config(format!("invalid 'in' duration '{offset}': {e}")))?;
            Ok(ScheduleAt::In(duration))
        }
        _ => Err(HubError::Config(
            "exactly one of 'scheduled_for' or 'in' is required".to_string(),
        )),
    }
}

/// `POST /api/v1/schedules`
pub async fn create(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<CreateRequest>,
) -> Result<Json<Schedule>, ApiError> {
    let when = parse_when(&body)?;
    let schedule = state
        .scheduler
        .create(&tenant, &body.topic, body.data, when)
        .await?;
    Ok(Json(schedule))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// `GET /api/v1/schedules`
pub async fn list(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Schedule>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(ScheduleStatus::parse(raw).ok_or_else(|| {
            HubError::Config(format!("unknown schedule status '{raw}'"))
        })?),
        None => None,
    };
    Ok(Json(state.scheduler.list(&tenant, status).await?))
}

/// `GET /api/v1/schedules/:id`
pub async fn fetch(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.scheduler.get(&tenant, &id).await?))
}

/// `DELETE /api/v1/schedules/:id` - cancel a pending schedule
pub async fn cancel(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.scheduler.cancel(&tenant, &id).await?))
}

/// `POST /api/v1/schedules/:id/run` - claim and execute immediately
pub async fn run_now(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.scheduler.run_now(&tenant, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(scheduled_for: Option<&str>, offset: Option<&str>) -> CreateRequest {
        CreateRequest {
            topic: "t".to_string(),
            data: serde_json::json!({}),
            scheduled_for: scheduled_for.map(String::from),
            offset: offset.map(String::from),
        }
    }

    #[test]
    fn test_parse_when_rfc3339() {
        let when = parse_when(&request(Some("2026-01-01T00:00:00Z"), None)).unwrap();
        assert!(matches!(when, ScheduleAt::At(_)));
    }

    #[test]
    fn test_parse_when_offset() {
        let when = parse_when(&request(None, Some("30m"))).unwrap();
        match when {
            ScheduleAt::In(d) => assert_eq!(d, std::time::Duration::from_secs(1800)),
            _ => panic!("expected offset"),
        }
    }

    #[test]
    fn test_parse_when_requires_exactly_one() {
        assert!(parse_when(&request(None, None)).is_err());
        assert!(parse_when(&request(Some("2026-01-01T00:00:00Z"), Some("30m"))).is_err());
        assert!(parse_when(&request(Some("tomorrow"), None)).is_err());
        assert!(parse_when(&request(None, Some("eventually"))).is_err());
    }
}
