//! Operation handlers: the type→handler registry the pipeline dispatches
//! through, plus the handler contract.

mod access;
mod safe;
mod sync_ops;

pub use access::{AccessGrantHandler, AccessRevokeHandler};
pub use safe::{SafeDeleteHandler, SafeModifyHandler, SafeProvisionHandler};
pub use sync_ops::SyncOperationHandler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vp_domain::operation::{Operation, OperationType};
use vp_domain::sync::SyncType;
use vp_upstream::{CyberArkClient, UpstreamError};

use super::sync_engine::SyncEngine;

/// What a handler invocation produced.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Success; the blob is stored as the operation's result.
    Ok(serde_json::Value),
    /// Transient failure; requeue with backoff while retries remain.
    Retry(String),
    /// Permanent failure; no retry regardless of the counter.
    Fail(String),
    /// The handler observed cancellation and stopped cleanly.
    Cancelled(Option<String>),
}

impl HandlerOutcome {
    /// Map a classified upstream failure onto the retry policy.
    pub fn from_upstream_error(error: UpstreamError) -> Self {
        if error.is_retryable() {
            Self::Retry(error.to_string())
        } else {
            Self::Fail(error.to_string())
        }
    }
}

/// Everything a handler gets for one invocation. The client is present
/// exactly when the operation targets an instance; the token reflects both
/// operator cancel requests and process shutdown.
pub struct HandlerContext {
    pub operation: Operation,
    pub client: Option<CyberArkClient>,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    /// The upstream client, or a terminal failure for operations that
    /// require a target instance but were created without one.
    pub fn require_client(&self) -> Result<&CyberArkClient, HandlerOutcome> {
        self.client.as_ref().ok_or_else(|| {
            HandlerOutcome::Fail("operation requires a target instance".to_string())
        })
    }

    /// A required string field from the payload, or a terminal failure.
    pub fn required_str(&self, key: &str) -> Result<String, HandlerOutcome> {
        self.operation
            .payload
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HandlerOutcome::Fail(format!("payload is missing {key:?}")))
    }
}

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome;
}

/// Type→handler mapping, populated at startup. Unknown types fail loudly in
/// the pipeline rather than silently requeueing.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op_type: OperationType, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(op_type, handler);
    }

    pub fn get(&self, op_type: OperationType) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&op_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<OperationType> {
        self.handlers.keys().copied().collect()
    }
}

/// The production registry: every operation type the service ships.
pub fn default_registry(engine: Arc<SyncEngine>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(OperationType::SafeProvision, Arc::new(SafeProvisionHandler));
    registry.register(OperationType::SafeModify, Arc::new(SafeModifyHandler));
    registry.register(OperationType::SafeDelete, Arc::new(SafeDeleteHandler));
    registry.register(OperationType::AccessGrant, Arc::new(AccessGrantHandler));
    registry.register(OperationType::AccessRevoke, Arc::new(AccessRevokeHandler));
    registry.register(
        OperationType::UserSync,
        Arc::new(SyncOperationHandler::new(engine.clone(), SyncType::Users)),
    );
    registry.register(
        OperationType::SafeSync,
        Arc::new(SyncOperationHandler::new(engine.clone(), SyncType::Safes)),
    );
    registry.register(
        OperationType::GroupSync,
        Arc::new(SyncOperationHandler::new(engine, SyncType::Groups)),
    );
    registry
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use vp_domain::operation::{OperationStatus, Priority};

    pub(crate) fn sample_operation(payload: serde_json::Value) -> Operation {
        Operation {
            id: vp_domain::ids::operation_id(),
            op_type: OperationType::SafeProvision,
            priority: Priority::Normal,
            status: OperationStatus::Processing,
            payload,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            created_by: None,
            cyberark_instance_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn registry_round_trip() {
        struct Noop;
        #[async_trait]
        impl OperationHandler for Noop {
            async fn execute(&self, _ctx: HandlerContext) -> HandlerOutcome {
                HandlerOutcome::Ok(serde_json::json!({}))
            }
        }

        let mut registry = HandlerRegistry::new();
        assert!(registry.get(OperationType::SafeProvision).is_none());
        registry.register(OperationType::SafeProvision, Arc::new(Noop));
        assert!(registry.get(OperationType::SafeProvision).is_some());
        assert!(registry.get(OperationType::AccessGrant).is_none());
    }

    #[test]
    fn upstream_error_maps_to_retry_policy() {
        let retry = HandlerOutcome::from_upstream_error(UpstreamError::Transport("x".into()));
        assert!(matches!(retry, HandlerOutcome::Retry(_)));

        let fail = HandlerOutcome::from_upstream_error(UpstreamError::Unauthorized);
        assert!(matches!(fail, HandlerOutcome::Fail(_)));
    }

    #[test]
    fn context_field_extraction() {
        let ctx = HandlerContext {
            operation: sample_operation(serde_json::json!({"safe_name": "PROD-DB", "empty": ""})),
            client: None,
            cancel: CancellationToken::new(),
        };
        assert_eq!(ctx.required_str("safe_name").unwrap(), "PROD-DB");
        assert!(ctx.required_str("missing").is_err());
        assert!(ctx.required_str("empty").is_err());
        assert!(ctx.require_client().is_err());
    }
}
