//! Sync-typed operations (`user_sync`, `safe_sync`, `group_sync`) delegate
//! to the sync engine, so a queued sync and a scheduled sync share the same
//! single-flight rule and reconciliation path.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use vp_domain::sync::{SyncType, TriggeredBy};
use vp_domain::Error;

use super::{HandlerContext, HandlerOutcome, OperationHandler};
use crate::runtime::sync_engine::SyncEngine;

pub struct SyncOperationHandler {
    engine: Arc<SyncEngine>,
    sync_type: SyncType,
}

impl SyncOperationHandler {
    pub fn new(engine: Arc<SyncEngine>, sync_type: SyncType) -> Self {
        Self { engine, sync_type }
    }
}

#[async_trait]
impl OperationHandler for SyncOperationHandler {
    async fn execute(&self, ctx: HandlerContext) -> HandlerOutcome {
        let instance_id = match &ctx.operation.cyberark_instance_id {
            Some(id) => id.clone(),
            None => return HandlerOutcome::Fail("operation requires a target instance".into()),
        };
        if ctx.cancel.is_cancelled() {
            return HandlerOutcome::Cancelled(None);
        }

        match self
            .engine
            .run_inline(
                instance_id,
                self.sync_type,
                TriggeredBy::System,
                ctx.cancel.clone(),
            )
            .await
        {
            Ok(job) => {
                let failed = job.status == vp_domain::sync::SyncJobStatus::Failed;
                let blob = json!({
                    "sync_job_id": job.id,
                    "status": job.status,
                    "records_synced": job.records_synced,
                    "records_created": job.records_created,
                    "records_updated": job.records_updated,
                    "records_deleted": job.records_deleted,
                    "records_failed": job.records_failed,
                });
                if failed {
                    HandlerOutcome::Retry(
                        job.error_message
                            .unwrap_or_else(|| "sync run failed".to_string()),
                    )
                } else {
                    HandlerOutcome::Ok(blob)
                }
            }
            // Another run holds the key; try again after backoff.
            Err(Error::Conflict(msg)) => HandlerOutcome::Retry(msg),
            Err(e) if e.is_retryable() => HandlerOutcome::Retry(e.to_string()),
            Err(e) => HandlerOutcome::Fail(e.to_string()),
        }
    }
}
