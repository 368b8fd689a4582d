//! Session authentication.
//!
//! The web UI carries the session token in the `vp_session` cookie; the CLI
//! sends it as a bearer header. Both resolve against the same session
//! table, with expiry enforced on lookup. Admin-gated routes additionally
//! check the account's admin flag.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use vp_domain::user::User;

use super::error::{api_error, ApiResult};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "vp_session";

/// The authenticated user, injected by [`require_session`].
#[derive(Clone)]
pub struct CurrentUser(pub User);

/// The raw session token of the current request (for logout).
#[derive(Clone)]
pub struct SessionToken(pub String);

/// Pull the session token out of a request: bearer header first, then the
/// session cookie.
fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_session_cookie)
}

fn parse_session_cookie(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the session and inject [`CurrentUser`]; 401 otherwise.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(&request) else {
        return api_error(StatusCode::UNAUTHORIZED, "missing session token");
    };
    match state.store.get_session_user(token.clone()).await {
        Ok((_session, user)) => {
            request.extensions_mut().insert(CurrentUser(user));
            request.extensions_mut().insert(SessionToken(token));
            next.run(request).await
        }
        Err(e) => api_error(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

/// Gate a route on the admin flag. Must run inside [`require_session`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<CurrentUser>() {
        Some(CurrentUser(user)) if user.is_admin => next.run(request).await,
        Some(_) => api_error(StatusCode::FORBIDDEN, "administrator access required"),
        None => api_error(StatusCode::UNAUTHORIZED, "missing session"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/auth/login
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let user = state
        .store
        .verify_credentials(req.username, req.password)
        .await?;
    let session = state
        .store
        .create_session(user.id.clone(), state.config.session_ttl)
        .await?;

    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        session.token,
        state.config.session_ttl.as_secs()
    );
    let body = Json(serde_json::json!({
        "user": user,
        "token": session.token,
        "expires_at": session.expires_at,
    }));
    Ok(([(header::SET_COOKIE, cookie)], body).into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/auth/logout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn logout(
    State(state): State<AppState>,
    axum::Extension(SessionToken(token)): axum::Extension<SessionToken>,
) -> ApiResult<Response> {
    state.store.delete_session(token).await?;
    let clear = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0");
    Ok((
        [(header::SET_COOKIE, clear)],
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/auth/me
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn me(
    axum::Extension(CurrentUser(user)): axum::Extension<CurrentUser>,
) -> impl IntoResponse {
    Json(serde_json::json!({ "user": user }))
}
