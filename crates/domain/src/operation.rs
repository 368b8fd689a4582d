//! Operation data model — the unit of work the pipeline executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Kind of administrative action. The pipeline dispatches to a handler
/// registered for the type; unknown types fail loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SafeProvision,
    SafeModify,
    SafeDelete,
    AccessGrant,
    AccessRevoke,
    UserSync,
    SafeSync,
    GroupSync,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SafeProvision => "safe_provision",
            Self::SafeModify => "safe_modify",
            Self::SafeDelete => "safe_delete",
            Self::AccessGrant => "access_grant",
            Self::AccessRevoke => "access_revoke",
            Self::UserSync => "user_sync",
            Self::SafeSync => "safe_sync",
            Self::GroupSync => "group_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe_provision" => Some(Self::SafeProvision),
            "safe_modify" => Some(Self::SafeModify),
            "safe_delete" => Some(Self::SafeDelete),
            "access_grant" => Some(Self::AccessGrant),
            "access_revoke" => Some(Self::AccessRevoke),
            "user_sync" => Some(Self::UserSync),
            "safe_sync" => Some(Self::SafeSync),
            "group_sync" => Some(Self::GroupSync),
            _ => None,
        }
    }
}

/// Queue priority. Ordering is high > normal > low; ties break on
/// `scheduled_at`, then `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Claim-order rank: lower sorts first.
    pub fn rank(self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Operation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits a transition to `next`.
    ///
    /// `Processing → Pending` is the retry edge; `Pending → Cancelled` is a
    /// direct cancel of a queued operation.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operation record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub priority: Priority,
    pub status: OperationStatus,
    /// Type-specific input, opaque to the pipeline.
    pub payload: serde_json::Value,
    /// Handler-defined output, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the operation is eligible for claim.
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// None for system-originated operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// None for cross-instance operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cyberark_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    /// None = eligible immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub cyberark_instance_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl NewOperation {
    pub fn new(op_type: OperationType, payload: serde_json::Value) -> Self {
        Self {
            op_type,
            priority: Priority::Normal,
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_at: None,
            created_by: None,
            cyberark_instance_id: None,
            correlation_id: None,
        }
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
