//! Operations pipeline: a single-claim sequential processor.
//!
//! Each cycle claims at most one pending operation (priority, then
//! schedule, then age), dispatches it to the registered handler for its
//! type, and records the outcome — completion, terminal failure, or a
//! backoff-scheduled retry. Every transition is published on the operation
//! event bus.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vp_domain::config::PipelineConfig;
use vp_domain::event::{OperationEvent, OperationEventType};
use vp_domain::operation::Operation;
use vp_store::Store;
use vp_upstream::ClientFactory;

use super::backoff::BackoffPolicy;
use super::cancel::CancelMap;
use super::events::EventBus;
use super::handlers::{HandlerContext, HandlerOutcome, HandlerRegistry};

#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    factory: Arc<ClientFactory>,
    registry: Arc<HandlerRegistry>,
    events: EventBus<OperationEvent>,
    cancel_map: Arc<CancelMap>,
    config: PipelineConfig,
    backoff: BackoffPolicy,
}

impl Pipeline {
    pub fn new(
        store: Store,
        factory: Arc<ClientFactory>,
        registry: Arc<HandlerRegistry>,
        events: EventBus<OperationEvent>,
        cancel_map: Arc<CancelMap>,
        config: PipelineConfig,
    ) -> Self {
        let backoff = BackoffPolicy::from(&config);
        Self {
            store,
            factory,
            registry,
            events,
            cancel_map,
            config,
            backoff,
        }
    }

    pub fn events(&self) -> &EventBus<OperationEvent> {
        &self.events
    }

    /// Startup recovery: rows left in `processing` by a crash go back to
    /// `pending` with `retry_count` incremented. At-least-once delivery —
    /// handlers are idempotent against upstream state.
    pub async fn recover(&self) -> vp_domain::Result<usize> {
        let recovered = self.store.recover_processing_operations().await?;
        for operation in &recovered {
            tracing::warn!(
                operation_id = %operation.id,
                retry_count = operation.retry_count,
                "operation recovered after restart"
            );
            self.events.publish(OperationEvent::new(
                OperationEventType::Updated,
                operation.clone(),
            ));
        }
        Ok(recovered.len())
    }

    /// Claim/process until shutdown. After a claimed operation finishes the
    /// next claim is attempted immediately; the poll sleep only applies to
    /// an empty queue.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            poll_seconds = self.config.poll_interval.as_secs(),
            "operations pipeline started"
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.store.claim_next_operation().await {
                Ok(Some(operation)) => {
                    self.process(operation, &shutdown).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "claim attempt failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::info!("operations pipeline stopped");
    }

    async fn process(&self, operation: Operation, shutdown: &CancellationToken) {
        let operation_id = operation.id.clone();
        tracing::info!(
            operation_id = %operation_id,
            op_type = operation.op_type.as_str(),
            retry_count = operation.retry_count,
            "operation claimed"
        );
        self.events
            .publish(OperationEvent::from_transition(operation.clone()));

        let Some(handler) = self.registry.get(operation.op_type) else {
            // Unknown types fail loudly rather than silently requeue.
            self.finish_with(
                &operation_id,
                self.store
                    .fail_operation(
                        operation_id.clone(),
                        format!("no handler registered for {}", operation.op_type.as_str()),
                    )
                    .await,
            )
            .await;
            return;
        };

        let client = match self.build_client(&operation).await {
            Ok(client) => client,
            Err(reason) => {
                self.finish_with(
                    &operation_id,
                    self.store.fail_operation(operation_id.clone(), reason).await,
                )
                .await;
                return;
            }
        };

        let cancel = self.cancel_map.register(&operation_id, shutdown);
        let deadline = self.config.timeout_for(operation.op_type);
        let retry_count = operation.retry_count;
        let max_retries = operation.max_retries;

        let ctx = HandlerContext {
            operation,
            client,
            cancel: cancel.clone(),
        };
        let outcome = match tokio::time::timeout(deadline, handler.execute(ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Deadline elapsed: the handler future was dropped; signal
                // the token for anything it spawned.
                cancel.cancel();
                HandlerOutcome::Retry(format!("timeout after {}s", deadline.as_secs()))
            }
        };
        self.cancel_map.remove(&operation_id);

        // An operator cancel (as opposed to process shutdown) must end in a
        // terminal state even when the handler ignored the token: a
        // cancel-requested operation is never completed or requeued.
        let outcome = if cancel.is_cancelled() && !shutdown.is_cancelled() {
            match outcome {
                HandlerOutcome::Ok(_) => HandlerOutcome::Cancelled(Some(
                    "cancellation requested; handler result discarded".into(),
                )),
                HandlerOutcome::Retry(reason) => HandlerOutcome::Cancelled(Some(format!(
                    "cancellation requested during retryable failure: {reason}"
                ))),
                terminal => terminal,
            }
        } else {
            outcome
        };

        let result = match outcome {
            HandlerOutcome::Ok(blob) => self.store.complete_operation(operation_id.clone(), blob).await,
            HandlerOutcome::Retry(reason) => {
                if retry_count < max_retries {
                    let delay = self.backoff.delay(retry_count + 1);
                    tracing::info!(
                        operation_id = %operation_id,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "operation requeued"
                    );
                    self.store
                        .retry_operation(
                            operation_id.clone(),
                            reason,
                            Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero()),
                        )
                        .await
                } else {
                    self.store.fail_operation(operation_id.clone(), reason).await
                }
            }
            HandlerOutcome::Fail(reason) => {
                self.store.fail_operation(operation_id.clone(), reason).await
            }
            HandlerOutcome::Cancelled(message) => {
                self.store
                    .mark_operation_cancelled(operation_id.clone(), message)
                    .await
            }
        };
        self.finish_with(&operation_id, result).await;
    }

    /// Build the upstream client for an instance-targeted operation.
    async fn build_client(
        &self,
        operation: &Operation,
    ) -> Result<Option<vp_upstream::CyberArkClient>, String> {
        let Some(instance_id) = &operation.cyberark_instance_id else {
            return Ok(None);
        };
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|e| format!("loading instance: {e}"))?;
        let password = self
            .store
            .instance_password(&instance)
            .await
            .map_err(|e| format!("decrypting instance credential: {e}"))?;
        self.factory
            .client_for_instance(&instance, password)
            .map(Some)
            .map_err(|e| format!("building upstream client: {e}"))
    }

    async fn finish_with(
        &self,
        operation_id: &str,
        result: vp_domain::Result<Operation>,
    ) {
        match result {
            Ok(operation) => {
                tracing::info!(
                    operation_id = %operation_id,
                    status = operation.status.as_str(),
                    "operation transition recorded"
                );
                self.events
                    .publish(OperationEvent::from_transition(operation));
            }
            Err(e) => {
                // A lost race with an operator cancel can land here; the
                // row already carries its terminal state.
                tracing::warn!(operation_id = %operation_id, error = %e, "recording outcome failed");
            }
        }
    }
}
