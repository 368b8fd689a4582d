//! Sync jobs and sync configs API.
//!
//! - `GET   /api/instances/:iid/sync-jobs`                — list for instance
//! - `POST  /api/instances/:iid/sync-jobs/trigger`        — manual trigger (admin)
//! - `GET   /api/instances/:iid/sync-configs`             — all three configs
//! - `PATCH /api/instances/:iid/sync-configs/:sync_type`  — update (admin)
//! - `GET   /api/sync-jobs/:id`                           — detail
//! - `GET   /api/sync-jobs/stream`                        — SSE lifecycle events

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use vp_domain::page::{PageRequest, SyncJobFilter};
use vp_domain::sync::{SyncConfigPatch, SyncJobStatus, SyncType, TriggeredBy};
use vp_domain::Error;

use super::auth::CurrentUser;
use super::error::ApiResult;
use super::sse;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListSyncJobsQuery {
    pub sync_type: Option<String>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerSyncRequest {
    pub sync_type: SyncType,
}

fn parse_sync_type(raw: &str) -> Result<SyncType, Error> {
    SyncType::parse(raw).ok_or_else(|| Error::Validation(format!("unknown sync type {raw:?}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sync_jobs(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<ListSyncJobsQuery>,
) -> ApiResult<Response> {
    // 404 for unknown instances instead of an empty page.
    state.store.get_instance(&instance_id).await?;

    let sync_type = query.sync_type.as_deref().map(parse_sync_type).transpose()?;
    let status = query
        .status
        .map(|s| {
            SyncJobStatus::parse(&s)
                .ok_or_else(|| Error::Validation(format!("unknown status {s:?}")))
        })
        .transpose()?;

    let defaults = PageRequest::default();
    let page_request = PageRequest {
        page: query.page.unwrap_or(defaults.page),
        page_size: query.page_size.unwrap_or(defaults.page_size),
    };
    let page = state
        .store
        .list_sync_jobs(
            SyncJobFilter {
                cyberark_instance_id: Some(instance_id),
                sync_type,
                status,
            },
            page_request,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "sync_jobs": page.items,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
        "total_pages": page.total_pages,
    }))
    .into_response())
}

pub async fn get_sync_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let job = state.store.get_sync_job(id).await?;
    Ok(Json(serde_json::json!({ "sync_job": job })).into_response())
}

/// Manual trigger. Bypasses the due check but still honours the
/// at-most-one-in-flight rule: a second trigger while one runs comes back
/// 409 with the running job named in the error.
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<TriggerSyncRequest>,
) -> ApiResult<Response> {
    let job = state
        .sync_engine
        .trigger(
            instance_id,
            req.sync_type,
            TriggeredBy::Manual,
            state.shutdown.child_token(),
        )
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "sync_job": job })),
    )
        .into_response())
}

pub async fn get_sync_configs(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Response> {
    state.store.get_instance(&instance_id).await?;
    let configs = state.store.get_instance_sync_configs(instance_id).await?;
    Ok(Json(serde_json::json!({ "sync_configs": configs })).into_response())
}

pub async fn update_sync_config(
    State(state): State<AppState>,
    Path((instance_id, sync_type)): Path<(String, String)>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(patch): Json<SyncConfigPatch>,
) -> ApiResult<Response> {
    let sync_type = parse_sync_type(&sync_type)?;
    let config = state
        .store
        .update_sync_config(instance_id, sync_type, patch, Some(user.id))
        .await?;
    Ok(Json(serde_json::json!({ "sync_config": config })).into_response())
}

pub async fn sync_events_sse(State(state): State<AppState>) -> impl IntoResponse {
    sse::event_stream(state.sync_events.subscribe(), state.shutdown.clone())
}
