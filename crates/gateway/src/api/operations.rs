//! Operations API.
//!
//! - `GET    /api/operations`              — filtered, paginated listing
//! - `POST   /api/operations`              — create (admin)
//! - `GET    /api/operations/:id`          — detail
//! - `POST   /api/operations/:id/cancel`   — cancel (admin)
//! - `PATCH  /api/operations/:id/priority` — re-prioritise (admin)
//! - `GET    /api/operations/stream`       — SSE lifecycle events

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use vp_domain::event::{OperationEvent, OperationEventType};
use vp_domain::operation::{NewOperation, OperationStatus, OperationType, Priority, DEFAULT_MAX_RETRIES};
use vp_domain::page::{OperationFilter, PageRequest};
use vp_domain::Error;
use vp_store::CancelOutcome;

use super::auth::CurrentUser;
use super::error::ApiResult;
use super::sse;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListOperationsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub op_type: Option<String>,
    pub priority: Option<String>,
    pub search: Option<String>,
    pub instance_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

fn page_request(page: Option<u32>, page_size: Option<u32>) -> PageRequest {
    let defaults = PageRequest::default();
    PageRequest {
        page: page.unwrap_or(defaults.page),
        page_size: page_size.unwrap_or(defaults.page_size),
    }
}

fn parse_filter(query: ListOperationsQuery) -> Result<(OperationFilter, PageRequest), Error> {
    let status = query
        .status
        .map(|s| {
            OperationStatus::parse(&s)
                .ok_or_else(|| Error::Validation(format!("unknown status {s:?}")))
        })
        .transpose()?;
    let op_type = query
        .op_type
        .map(|s| {
            OperationType::parse(&s)
                .ok_or_else(|| Error::Validation(format!("unknown operation type {s:?}")))
        })
        .transpose()?;
    let priority = query
        .priority
        .map(|s| {
            Priority::parse(&s).ok_or_else(|| Error::Validation(format!("unknown priority {s:?}")))
        })
        .transpose()?;
    let page = page_request(query.page, query.page_size);
    Ok((
        OperationFilter {
            status,
            op_type,
            priority,
            search: query.search,
            created_after: query.created_after,
            created_before: query.created_before,
            cyberark_instance_id: query.instance_id,
        },
        page,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateOperationRequest {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub priority: Option<Priority>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub cyberark_instance_id: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePriorityRequest {
    pub priority: Priority,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<ListOperationsQuery>,
) -> ApiResult<Response> {
    let (filter, page) = parse_filter(query)?;
    let page = state.store.list_operations(filter, page).await?;
    Ok(Json(serde_json::json!({
        "operations": page.items,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
        "total_pages": page.total_pages,
    }))
    .into_response())
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let operation = state.store.get_operation(id).await?;
    Ok(Json(serde_json::json!({ "operation": operation })).into_response())
}

pub async fn create_operation(
    State(state): State<AppState>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(req): Json<CreateOperationRequest>,
) -> ApiResult<Response> {
    let new = NewOperation {
        op_type: req.op_type,
        priority: req.priority.unwrap_or_default(),
        payload: req.payload,
        max_retries: req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        scheduled_at: req.scheduled_at,
        created_by: Some(user.id),
        cyberark_instance_id: req.cyberark_instance_id,
        // Every operation belongs to a correlation group; standalone ones
        // get their own.
        correlation_id: req
            .correlation_id
            .or_else(|| Some(vp_domain::ids::correlation_id())),
    };
    let operation = state.store.create_operation(new).await?;
    state
        .operation_events
        .publish(OperationEvent::new(OperationEventType::Created, operation.clone()));
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "operation": operation })),
    )
        .into_response())
}

pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match state.store.cancel_operation(id.clone()).await? {
        CancelOutcome::Cancelled(operation) => {
            state
                .operation_events
                .publish(OperationEvent::from_transition(operation.clone()));
            Ok(Json(serde_json::json!({ "operation": operation })).into_response())
        }
        CancelOutcome::CancellationRequested(operation) => {
            // The handler decides the terminal state; signal it now.
            state.cancel_map.cancel(&id);
            state
                .operation_events
                .publish(OperationEvent::new(OperationEventType::Updated, operation.clone()));
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "operation": operation,
                    "cancellation_requested": true,
                })),
            )
                .into_response())
        }
    }
}

pub async fn update_priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(req): Json<UpdatePriorityRequest>,
) -> ApiResult<Response> {
    let operation = state
        .store
        .update_operation_priority(id, req.priority, Some(user.id))
        .await?;
    state
        .operation_events
        .publish(OperationEvent::new(OperationEventType::Updated, operation.clone()));
    Ok(Json(serde_json::json!({ "operation": operation })).into_response())
}

pub async fn operation_events_sse(State(state): State<AppState>) -> impl IntoResponse {
    sse::event_stream(state.operation_events.subscribe(), state.shutdown.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parsing_accepts_known_values() {
        let query = ListOperationsQuery {
            status: Some("pending".into()),
            op_type: Some("safe_provision".into()),
            priority: Some("high".into()),
            search: Some("corr".into()),
            instance_id: None,
            created_after: None,
            created_before: None,
            page: None,
            page_size: None,
        };
        let (filter, _) = parse_filter(query).unwrap();
        assert_eq!(filter.status, Some(OperationStatus::Pending));
        assert_eq!(filter.op_type, Some(OperationType::SafeProvision));
        assert_eq!(filter.priority, Some(Priority::High));
    }

    #[test]
    fn filter_parsing_rejects_unknown_values() {
        let query = ListOperationsQuery {
            status: Some("bogus".into()),
            op_type: None,
            priority: None,
            search: None,
            instance_id: None,
            created_after: None,
            created_before: None,
            page: None,
            page_size: None,
        };
        assert!(matches!(parse_filter(query), Err(Error::Validation(_))));
    }
}
