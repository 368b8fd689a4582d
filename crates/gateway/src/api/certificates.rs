//! Certificate authority registry.
//!
//! Blobs are validated before they touch the store (every certificate a CA,
//! chain verifying against its own roots); every mutation triggers an
//! immediate trust-store refresh so the next upstream client sees it.
//!
//! - `GET    /api/certificate-authorities`     — list
//! - `POST   /api/certificate-authorities`     — register (admin)
//! - `GET    /api/certificate-authorities/:id` — detail
//! - `PATCH  /api/certificate-authorities/:id` — activate/deactivate (admin)
//! - `DELETE /api/certificate-authorities/:id` — remove (admin)

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use vp_domain::certificate::NewCertificateAuthority;

use super::auth::CurrentUser;
use super::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateCertificateAuthorityRequest {
    pub is_active: bool,
}

async fn refresh_trust(state: &AppState) {
    if let Err(e) = state.trust.refresh().await {
        tracing::warn!(error = %e, "trust refresh after CA mutation failed");
    }
}

pub async fn list_certificate_authorities(State(state): State<AppState>) -> ApiResult<Response> {
    let cas = state.store.list_certificate_authorities().await?;
    Ok(Json(serde_json::json!({ "certificate_authorities": cas })).into_response())
}

pub async fn get_certificate_authority(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let ca = state.store.get_certificate_authority(id).await?;
    Ok(Json(serde_json::json!({ "certificate_authority": ca })).into_response())
}

pub async fn create_certificate_authority(
    State(state): State<AppState>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(req): Json<NewCertificateAuthority>,
) -> ApiResult<Response> {
    let record = vp_upstream::validate_ca_blob(&req.name, &req.pem, Some(user.id))?;
    let ca = state.store.create_certificate_authority(record).await?;
    refresh_trust(&state).await;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "certificate_authority": ca })),
    )
        .into_response())
}

pub async fn update_certificate_authority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
    Json(req): Json<UpdateCertificateAuthorityRequest>,
) -> ApiResult<Response> {
    let ca = state
        .store
        .set_certificate_authority_active(id, req.is_active, Some(user.id))
        .await?;
    refresh_trust(&state).await;
    Ok(Json(serde_json::json!({ "certificate_authority": ca })).into_response())
}

pub async fn delete_certificate_authority(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.store.delete_certificate_authority(id).await?;
    refresh_trust(&state).await;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}
