//! Materialised upstream snapshots with soft-delete reconciliation.
//!
//! Each snapshot row mirrors one upstream record, unique on
//! `(instance_id, upstream_id)`. Rows are never hard-deleted by a sync run:
//! a record missing from the upstream is soft-deleted, and a previously
//! soft-deleted record that reappears is undeleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mirror of an upstream vault user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyberArkUser {
    pub id: String,
    pub cyberark_instance_id: String,
    pub upstream_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
    pub suspended: bool,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mirror of an upstream group membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub id: String,
    pub cyberark_instance_id: String,
    pub upstream_id: String,
    pub group_name: String,
    pub member_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_type: Option<String>,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mirror of an upstream safe authorization (who may do what on a safe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultAuthorization {
    pub id: String,
    pub cyberark_instance_id: String,
    pub upstream_id: String,
    pub safe_name: String,
    pub member_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Value>,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream records (reconciler input)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An upstream user as seen during a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUserRecord {
    pub upstream_id: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub user_type: Option<String>,
    pub suspended: bool,
}

/// An upstream group membership as seen during a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamMembershipRecord {
    pub upstream_id: String,
    pub group_name: String,
    pub member_username: String,
    pub member_type: Option<String>,
}

/// An upstream safe authorization as seen during a sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamAuthorizationRecord {
    pub upstream_id: String,
    pub safe_name: String,
    pub member_name: String,
    pub permissions: Option<serde_json::Value>,
}
