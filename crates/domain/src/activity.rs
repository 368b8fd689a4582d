//! Unified chronological activity view over operations and sync jobs.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Operation,
    SyncJob,
}

/// A common projection of either record kind, ordered by creation time.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub id: String,
    pub kind: ActivityKind,
    /// Operation type or sync type, as its snake_case tag.
    #[serde(rename = "type")]
    pub item_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cyberark_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filters for the activity listing.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub kind: Option<ActivityKind>,
    pub cyberark_instance_id: Option<String>,
    pub status: Option<String>,
}
