//! Safe administration handlers. All three are idempotent against upstream
//! state: re-running a provision after a crash finds the safe already there
//! and reports success instead of erroring.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use vp_upstream::UpstreamError;

use super::{HandlerContext, HandlerOutcome, OperationHandler};

/// `safe_provision`: create a safe, then grant any requested members.
///
/// Payload: `{"safe_name", "description"?, "members"?: [{"member_name", "permissions"?}]}`.
pub struct SafeProvisionHandler;

#[async_trait]
impl OperationHandler for SafeProvisionHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome {
        let client = match ctx.require_client() {
            Ok(c) => c,
            Err(outcome) => return outcome,
        };
        let safe_name = match ctx.required_str("safe_name") {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };
        if ctx.cancel.is_cancelled() {
            return HandlerOutcome::Cancelled(None);
        }

        let session = match client.logon().await {
            Ok(s) => s,
            Err(e) => return HandlerOutcome::from_upstream_error(e),
        };

        // Idempotency: a previous attempt may have created the safe before
        // the process died. An existing safe is a success, not a conflict.
        let already_existed = match session.get_safe(&safe_name).await {
            Ok(_) => true,
            Err(UpstreamError::NotFound(_)) => false,
            Err(e) => {
                let _ = session.logoff().await;
                return HandlerOutcome::from_upstream_error(e);
            }
        };

        if !already_existed {
            let mut body = json!({ "safeName": safe_name });
            if let Some(description) = ctx.operation.payload.get("description") {
                body["description"] = description.clone();
            }
            if let Err(e) = session.create_safe(&body).await {
                let _ = session.logoff().await;
                return HandlerOutcome::from_upstream_error(e);
            }
        }

        // Grant requested members; a member that is already present (409)
        // is fine on retry.
        let members = ctx
            .operation
            .payload
            .get("members")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();
        let mut granted = 0usize;
        for member in &members {
            if ctx.cancel.is_cancelled() {
                let _ = session.logoff().await;
                return HandlerOutcome::Cancelled(Some("cancelled while granting members".into()));
            }
            match session.add_safe_member(&safe_name, member).await {
                Ok(_) => granted += 1,
                Err(UpstreamError::Other { status: 409, .. }) => granted += 1,
                Err(e) => {
                    let _ = session.logoff().await;
                    return HandlerOutcome::from_upstream_error(e);
                }
            }
        }

        if let Err(e) = session.logoff().await {
            tracing::warn!(operation_id = %ctx.operation.id, error = %e, "logoff failed");
        }
        info!(operation_id = %ctx.operation.id, safe = %safe_name, already_existed, "safe provisioned");
        HandlerOutcome::Ok(json!({
            "safe_name": safe_name,
            "already_existed": already_existed,
            "members_granted": granted,
        }))
    }
}

/// `safe_modify`: apply an update body to an existing safe.
///
/// Payload: `{"safe_name", "update": {...}}` — the update body passes
/// through to the vault as-is.
pub struct SafeModifyHandler;

#[async_trait]
impl OperationHandler for SafeModifyHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome {
        let client = match ctx.require_client() {
            Ok(c) => c,
            Err(outcome) => return outcome,
        };
        let safe_name = match ctx.required_str("safe_name") {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };
        let update = match ctx.operation.payload.get("update") {
            Some(u) if u.is_object() => u.clone(),
            _ => return HandlerOutcome::Fail("payload is missing \"update\" object".into()),
        };
        if ctx.cancel.is_cancelled() {
            return HandlerOutcome::Cancelled(None);
        }

        let session = match client.logon().await {
            Ok(s) => s,
            Err(e) => return HandlerOutcome::from_upstream_error(e),
        };
        let result = session.update_safe(&safe_name, &update).await;
        if let Err(e) = session.logoff().await {
            tracing::warn!(operation_id = %ctx.operation.id, error = %e, "logoff failed");
        }

        match result {
            Ok(updated) => HandlerOutcome::Ok(json!({ "safe_name": safe_name, "safe": updated })),
            Err(e) => HandlerOutcome::from_upstream_error(e),
        }
    }
}

/// `safe_delete`: remove a safe. A safe that is already gone counts as
/// deleted.
pub struct SafeDeleteHandler;

#[async_trait]
impl OperationHandler for SafeDeleteHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome {
        let client = match ctx.require_client() {
            Ok(c) => c,
            Err(outcome) => return outcome,
        };
        let safe_name = match ctx.required_str("safe_name") {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };
        if ctx.cancel.is_cancelled() {
            return HandlerOutcome::Cancelled(None);
        }

        let session = match client.logon().await {
            Ok(s) => s,
            Err(e) => return HandlerOutcome::from_upstream_error(e),
        };
        let result = match session.delete_safe(&safe_name).await {
            Ok(()) => Ok(true),
            Err(UpstreamError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        };
        if let Err(e) = session.logoff().await {
            tracing::warn!(operation_id = %ctx.operation.id, error = %e, "logoff failed");
        }

        match result {
            Ok(existed) => {
                HandlerOutcome::Ok(json!({ "safe_name": safe_name, "existed": existed }))
            }
            Err(e) => HandlerOutcome::from_upstream_error(e),
        }
    }
}
