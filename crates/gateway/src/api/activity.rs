//! Unified activity view: operations and sync jobs in one chronological
//! list, and one merged SSE stream.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use vp_domain::activity::{ActivityFilter, ActivityKind};
use vp_domain::page::PageRequest;
use vp_domain::Error;

use super::error::ApiResult;
use super::sse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListActivityQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub instance_id: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ListActivityQuery>,
) -> ApiResult<Response> {
    let kind = query
        .kind
        .map(|k| match k.as_str() {
            "operation" => Ok(ActivityKind::Operation),
            "sync_job" => Ok(ActivityKind::SyncJob),
            other => Err(Error::Validation(format!("unknown kind {other:?}"))),
        })
        .transpose()?;

    let defaults = PageRequest::default();
    let page_request = PageRequest {
        page: query.page.unwrap_or(defaults.page),
        page_size: query.page_size.unwrap_or(defaults.page_size),
    };
    let page = state
        .store
        .list_activity(
            ActivityFilter {
                kind,
                cyberark_instance_id: query.instance_id,
                status: query.status,
            },
            page_request,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "activity": page.items,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
        "total_pages": page.total_pages,
    }))
    .into_response())
}

pub async fn activity_events_sse(State(state): State<AppState>) -> impl IntoResponse {
    sse::merged_event_stream(
        state.operation_events.subscribe(),
        state.sync_events.subscribe(),
        state.shutdown.clone(),
    )
}
