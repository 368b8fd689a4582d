//! Lifecycle event envelopes published on the event bus and streamed to SSE
//! clients. The wire envelope is `{type, timestamp, operation?|sync_job?}`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::operation::{Operation, OperationStatus};
use crate::sync::SyncJob;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operation events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventType {
    Created,
    Started,
    Completed,
    Failed,
    Cancelled,
    Updated,
}

impl OperationEventType {
    /// Derive the event type from a status transition: `processing` maps to
    /// `started`, terminal states map to their own tag, anything else is a
    /// plain `updated`.
    pub fn from_status(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Processing => Self::Started,
            OperationStatus::Completed => Self::Completed,
            OperationStatus::Failed => Self::Failed,
            OperationStatus::Cancelled => Self::Cancelled,
            OperationStatus::Pending => Self::Updated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    #[serde(rename = "type")]
    pub event_type: OperationEventType,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
}

impl OperationEvent {
    pub fn new(event_type: OperationEventType, operation: Operation) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            operation,
        }
    }

    /// Event reflecting the operation's current status.
    pub fn from_transition(operation: Operation) -> Self {
        Self::new(OperationEventType::from_status(operation.status), operation)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sync job events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobEventType {
    SyncCreated,
    SyncUpdated,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncJobEvent {
    #[serde(rename = "type")]
    pub event_type: SyncJobEventType,
    pub timestamp: DateTime<Utc>,
    pub sync_job: SyncJob,
}

impl SyncJobEvent {
    pub fn created(sync_job: SyncJob) -> Self {
        Self {
            event_type: SyncJobEventType::SyncCreated,
            timestamp: Utc::now(),
            sync_job,
        }
    }

    pub fn updated(sync_job: SyncJob) -> Self {
        Self {
            event_type: SyncJobEventType::SyncUpdated,
            timestamp: Utc::now(),
            sync_job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_rule() {
        assert_eq!(
            OperationEventType::from_status(OperationStatus::Processing),
            OperationEventType::Started
        );
        assert_eq!(
            OperationEventType::from_status(OperationStatus::Completed),
            OperationEventType::Completed
        );
        assert_eq!(
            OperationEventType::from_status(OperationStatus::Failed),
            OperationEventType::Failed
        );
        assert_eq!(
            OperationEventType::from_status(OperationStatus::Cancelled),
            OperationEventType::Cancelled
        );
        assert_eq!(
            OperationEventType::from_status(OperationStatus::Pending),
            OperationEventType::Updated
        );
    }

    #[test]
    fn envelope_shape() {
        let op = sample_operation();
        let event = OperationEvent::new(OperationEventType::Created, op);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "created");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["operation"]["status"], "pending");
    }

    #[test]
    fn sync_envelope_shape() {
        let job = sample_job();
        let event = SyncJobEvent::created(job);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync_created");
        assert_eq!(json["sync_job"]["sync_type"], "users");
    }

    fn sample_operation() -> Operation {
        use crate::operation::*;
        Operation {
            id: crate::ids::operation_id(),
            op_type: OperationType::SafeProvision,
            priority: Priority::Normal,
            status: OperationStatus::Pending,
            payload: serde_json::json!({}),
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            created_by: None,
            cyberark_instance_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_job() -> SyncJob {
        use crate::sync::*;
        SyncJob {
            id: crate::ids::sync_job_id(),
            cyberark_instance_id: crate::ids::instance_id(),
            sync_type: SyncType::Users,
            status: SyncJobStatus::Pending,
            triggered_by: TriggeredBy::Scheduled,
            records_synced: 0,
            records_created: 0,
            records_updated: 0,
            records_deleted: 0,
            records_failed: 0,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
