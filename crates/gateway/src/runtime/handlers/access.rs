//! Access grant/revoke handlers. Both are idempotent: granting a member
//! that already exists and revoking one that is already gone succeed.

use async_trait::async_trait;
use serde_json::json;
use vp_upstream::UpstreamError;

use super::{HandlerContext, HandlerOutcome, OperationHandler};

/// `access_grant`: add a member to a safe.
///
/// Payload: `{"safe_name", "member_name", "permissions"?: {...}}`.
pub struct AccessGrantHandler;

#[async_trait]
impl OperationHandler for AccessGrantHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome {
        let client = match ctx.require_client() {
            Ok(c) => c,
            Err(outcome) => return outcome,
        };
        let safe_name = match ctx.required_str("safe_name") {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };
        let member_name = match ctx.required_str("member_name") {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };
        if ctx.cancel.is_cancelled() {
            return HandlerOutcome::Cancelled(None);
        }

        let mut body = json!({ "memberName": member_name });
        if let Some(permissions) = ctx.operation.payload.get("permissions") {
            body["permissions"] = permissions.clone();
        }

        let session = match client.logon().await {
            Ok(s) => s,
            Err(e) => return HandlerOutcome::from_upstream_error(e),
        };
        let result = match session.add_safe_member(&safe_name, &body).await {
            Ok(member) => Ok(json!({
                "safe_name": safe_name,
                "member_name": member_name,
                "member": member,
            })),
            // Already a member: grant is satisfied.
            Err(UpstreamError::Other { status: 409, .. }) => Ok(json!({
                "safe_name": safe_name,
                "member_name": member_name,
                "already_member": true,
            })),
            Err(e) => Err(e),
        };
        if let Err(e) = session.logoff().await {
            tracing::warn!(operation_id = %ctx.operation.id, error = %e, "logoff failed");
        }

        match result {
            Ok(blob) => HandlerOutcome::Ok(blob),
            Err(e) => HandlerOutcome::from_upstream_error(e),
        }
    }
}

/// `access_revoke`: remove a member from a safe.
///
/// Payload: `{"safe_name", "member_name"}`.
pub struct AccessRevokeHandler;

#[async_trait]
impl OperationHandler for AccessRevokeHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome {
        let client = match ctx.require_client() {
            Ok(c) => c,
            Err(outcome) => return outcome,
        };
        let safe_name = match ctx.required_str("safe_name") {
            Ok(s) => s,
            Err(outcome) => return outcome,
        };
        let member_name = match ctx.required_str("member_name") {
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
        let result = match session.remove_safe_member(&safe_name, &member_name).await {
            Ok(()) => Ok(true),
            // Already absent: revoke is satisfied.
            Err(UpstreamError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        };
        if let Err(e) = session.logoff().await {
            tracing::warn!(operation_id = %ctx.operation.id, error = %e, "logoff failed");
        }

        match result {
            Ok(was_member) => HandlerOutcome::Ok(json!({
                "safe_name": safe_name,
                "member_name": member_name,
                "was_member": was_member,
            })),
            Err(e) => HandlerOutcome::from_upstream_error(e),
        }
    }
}
