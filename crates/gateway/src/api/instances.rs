//! Upstream instance administration.
//!
//! - `GET    /api/instances`                      — list
//! - `POST   /api/instances`                      — register (admin)
//! - `GET    /api/instances/:iid`                 — detail
//! - `PATCH  /api/instances/:iid`                 — update (admin)
//! - `DELETE /api/instances/:iid`                 — delete, cascades (admin)
//! - `POST   /api/instances/:iid/test-connection` — authenticate + latency (admin)

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use vp_domain::instance::{InstancePatch, NewInstance};

use super::auth::CurrentUser;
use super::error::ApiResult;
use crate::state::AppState;

pub async fn list_instances(State(state): State<AppState>) -> ApiResult<Response> {
    let instances = state.store.list_instances().await?;
    Ok(Json(serde_json::json!({ "instances": instances })).into_response())
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let instance = state.store.get_instance(&id).await?;
    Ok(Json(serde_json::json!({ "instance": instance })).into_response())
}

pub async fn create_instance(
    State(state): State<AppState>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(req): Json<NewInstance>,
) -> ApiResult<Response> {
    let instance = state.store.create_instance(req, Some(user.id)).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "instance": instance })),
    )
        .into_response())
}

pub async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(patch): Json<InstancePatch>,
) -> ApiResult<Response> {
    let instance = state
        .store
        .update_instance(id, patch, Some(user.id))
        .await?;
    Ok(Json(serde_json::json!({ "instance": instance })).into_response())
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.store.delete_instance(id).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

/// Authenticate against the instance with its stored credentials, report
/// success and latency, and record the outcome on the instance row.
pub async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let instance = state.store.get_instance(&id).await?;
    let password = state.store.instance_password(&instance).await?;

    let outcome = match state.factory.client_for_instance(&instance, password) {
        Ok(client) => client.test_connection().await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(latency_ms) => {
            let instance = state.store.record_instance_test(id, true, None).await?;
            Ok(Json(serde_json::json!({
                "success": true,
                "latency_ms": latency_ms,
                "instance": instance,
            }))
            .into_response())
        }
        Err(e) => {
            let message = e.to_string();
            let instance = state
                .store
                .record_instance_test(id, false, Some(message.clone()))
                .await?;
            Ok(Json(serde_json::json!({
                "success": false,
                "error": message,
                "instance": instance,
            }))
            .into_response())
        }
    }
}
