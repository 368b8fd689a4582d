//! End-to-end operation lifecycle through the public crate surface: create,
//! process, observe events; cancel-before-claim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vp_domain::config::PipelineConfig;
use vp_domain::event::{OperationEvent, OperationEventType};
use vp_domain::operation::{NewOperation, OperationStatus, OperationType};
use vp_gateway::bootstrap::StoreCaSource;
use vp_gateway::runtime::handlers::{
    HandlerContext, HandlerOutcome, HandlerRegistry, OperationHandler,
};
use vp_gateway::runtime::{CancelMap, EventBus, Pipeline};
use vp_store::{CancelOutcome, Store};
use vp_upstream::{ClientFactory, TrustStore};

const TEST_KEY: &str = "test-encryption-key-0123456789abcdef";

struct ProvisionOk;

#[async_trait]
impl OperationHandler for ProvisionOk {
    async fn execute(&self, _ctx: HandlerContext) -> HandlerOutcome {
        HandlerOutcome::Ok(serde_json::json!({"safe_id": "s_1"}))
    }
}

async fn build_pipeline(store: Store) -> Pipeline {
    let trust = Arc::new(TrustStore::new(Arc::new(StoreCaSource::new(store.clone()))));
    let factory = Arc::new(ClientFactory::new(trust, Duration::from_secs(5)));
    let mut registry = HandlerRegistry::new();
    registry.register(OperationType::SafeProvision, Arc::new(ProvisionOk));

    let mut config = PipelineConfig::default();
    config.poll_interval = Duration::from_millis(20);

    Pipeline::new(
        store,
        factory,
        Arc::new(registry),
        EventBus::new("operations"),
        Arc::new(CancelMap::new()),
        config,
    )
}

#[tokio::test]
async fn create_process_complete_with_ordered_events() {
    let store = Store::open_in_memory(TEST_KEY).await.unwrap();
    let pipeline = build_pipeline(store.clone()).await;
    let mut events = pipeline.events().subscribe();

    // The API's create path: insert, then publish `created`.
    let operation = store
        .create_operation(NewOperation::new(
            OperationType::SafeProvision,
            serde_json::json!({"safe_name": "PROD-DB"}),
        ))
        .await
        .unwrap();
    pipeline.events().publish(OperationEvent::new(
        OperationEventType::Created,
        operation.clone(),
    ));

    let shutdown = CancellationToken::new();
    let runner = {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pipeline.run(shutdown).await })
    };

    // Completed within the 10s budget.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let final_op = loop {
        let current = store.get_operation(operation.id.clone()).await.unwrap();
        if current.status == OperationStatus::Completed {
            break current;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "operation did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(final_op.result.unwrap()["safe_id"], "s_1");
    assert_eq!(final_op.retry_count, 0);

    let mut order = Vec::new();
    while let Some(event) = events.try_recv() {
        order.push(event.event_type);
    }
    assert_eq!(
        order,
        vec![
            OperationEventType::Created,
            OperationEventType::Started,
            OperationEventType::Completed,
        ]
    );

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn cancelling_a_scheduled_operation_never_starts_it() {
    let store = Store::open_in_memory(TEST_KEY).await.unwrap();
    let pipeline = build_pipeline(store.clone()).await;
    let mut events = pipeline.events().subscribe();

    let mut new = NewOperation::new(
        OperationType::SafeProvision,
        serde_json::json!({"safe_name": "PROD-DB"}),
    );
    new.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    let operation = store.create_operation(new).await.unwrap();
    pipeline.events().publish(OperationEvent::new(
        OperationEventType::Created,
        operation.clone(),
    ));

    let shutdown = CancellationToken::new();
    let runner = {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pipeline.run(shutdown).await })
    };
    // Give the pipeline a few polls; the operation is not yet eligible.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The API's cancel path.
    match store.cancel_operation(operation.id.clone()).await.unwrap() {
        CancelOutcome::Cancelled(cancelled) => {
            pipeline
                .events()
                .publish(OperationEvent::from_transition(cancelled.clone()));
            assert_eq!(cancelled.status, OperationStatus::Cancelled);
            assert!(cancelled.started_at.is_none());
        }
        other => panic!("expected a direct cancel, got {other:?}"),
    }

    let mut order = Vec::new();
    while let Some(event) = events.try_recv() {
        order.push(event.event_type);
    }
    assert_eq!(
        order,
        vec![OperationEventType::Created, OperationEventType::Cancelled]
    );

    shutdown.cancel();
    runner.await.unwrap();
}
