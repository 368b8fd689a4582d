//! API router. Routes split into **public** (health, login), **protected**
//! (any authenticated session), and **admin** (mutations).

pub mod activity;
pub mod auth;
pub mod certificates;
pub mod error;
pub mod instances;
pub mod operations;
pub mod sse;
pub mod sync;

use axum::extract::State;
use axum::middleware;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router under `/api`.
///
/// `state` is needed to wire up the session middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login));

    let protected = Router::new()
        // Auth/session
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        // Operations
        .route("/api/operations", get(operations::list_operations))
        .route("/api/operations/stream", get(operations::operation_events_sse))
        .route("/api/operations/:id", get(operations::get_operation))
        // Sync jobs
        .route("/api/sync-jobs/stream", get(sync::sync_events_sse))
        .route("/api/sync-jobs/:id", get(sync::get_sync_job))
        .route("/api/instances/:iid/sync-jobs", get(sync::list_sync_jobs))
        .route("/api/instances/:iid/sync-configs", get(sync::get_sync_configs))
        // Activity
        .route("/api/activity", get(activity::list_activity))
        .route("/api/activity/stream", get(activity::activity_events_sse))
        // Instances & CAs (read side)
        .route("/api/instances", get(instances::list_instances))
        .route("/api/instances/:iid", get(instances::get_instance))
        .route(
            "/api/certificate-authorities",
            get(certificates::list_certificate_authorities),
        )
        .route(
            "/api/certificate-authorities/:id",
            get(certificates::get_certificate_authority),
        );

    let admin = Router::new()
        // Operations (mutations)
        .route("/api/operations", post(operations::create_operation))
        .route("/api/operations/:id/cancel", post(operations::cancel_operation))
        .route("/api/operations/:id/priority", patch(operations::update_priority))
        // Sync (mutations)
        .route("/api/instances/:iid/sync-jobs/trigger", post(sync::trigger_sync))
        .route(
            "/api/instances/:iid/sync-configs/:sync_type",
            patch(sync::update_sync_config),
        )
        // Instances (mutations)
        .route("/api/instances", post(instances::create_instance))
        .route("/api/instances/:iid", patch(instances::update_instance))
        .route("/api/instances/:iid", delete(instances::delete_instance))
        .route(
            "/api/instances/:iid/test-connection",
            post(instances::test_connection),
        )
        // Certificate authorities (mutations)
        .route(
            "/api/certificate-authorities",
            post(certificates::create_certificate_authority),
        )
        .route(
            "/api/certificate-authorities/:id",
            patch(certificates::update_certificate_authority),
        )
        .route(
            "/api/certificate-authorities/:id",
            delete(certificates::delete_certificate_authority),
        )
        .route_layer(middleware::from_fn(auth::require_admin));

    // Session middleware wraps both the protected and admin groups; the
    // admin layer runs inside it.
    let authed = protected.merge(admin).route_layer(middleware::from_fn_with_state(
        state,
        auth::require_session,
    ));

    public
        .merge(authed)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        Err(e) => Json(serde_json::json!({
            "status": "degraded",
            "error": e.to_string(),
        })),
    }
}
