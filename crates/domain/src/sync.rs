//! Sync data model — jobs, per-instance schedules, and counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which upstream inventory a sync materialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Users,
    Safes,
    Groups,
}

impl SyncType {
    pub const ALL: [SyncType; 3] = [SyncType::Users, SyncType::Safes, SyncType::Groups];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Safes => "safes",
            Self::Groups => "groups",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "users" => Some(Self::Users),
            "safes" => Some(Self::Safes),
            "groups" => Some(Self::Groups),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Scheduled,
    System,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sync job record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub cyberark_instance_id: String,
    pub sync_type: SyncType,
    pub status: SyncJobStatus,
    pub triggered_by: TriggeredBy,
    pub records_synced: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub records_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-run record counters, accumulated page by page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub synced: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub failed: u64,
}

impl SyncCounters {
    pub fn add(&mut self, other: SyncCounters) {
        self.synced += other.synced;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Instance sync config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const MIN_INTERVAL_MINUTES: u32 = 5;
pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 1000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MIN_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_TIMEOUT_MINUTES: u32 = 120;

/// Per-(instance, sync_type) schedule and limits. Unique on that pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSyncConfig {
    pub id: String,
    pub cyberark_instance_id: String,
    pub sync_type: SyncType,
    pub enabled: bool,
    pub interval_minutes: u32,
    pub page_size: u32,
    pub retry_attempts: u32,
    pub timeout_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<SyncJobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_message: Option<String>,
    /// None = never run, due immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceSyncConfig {
    /// Defaults applied when an instance is created.
    pub fn defaults(instance_id: &str, sync_type: SyncType) -> Self {
        let now = Utc::now();
        Self {
            id: crate::ids::sync_config_id(),
            cyberark_instance_id: instance_id.to_string(),
            sync_type,
            enabled: true,
            interval_minutes: 60,
            page_size: 100,
            retry_attempts: 3,
            timeout_minutes: 30,
            last_run_at: None,
            last_run_status: None,
            last_run_message: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map_or(true, |next| next <= now)
    }
}

/// Partial update for a sync config; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfigPatch {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<u32>,
    pub page_size: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub timeout_minutes: Option<u32>,
}

impl SyncConfigPatch {
    /// Validate field ranges. Returns the first violation.
    pub fn validate(&self) -> Result<()> {
        if let Some(v) = self.interval_minutes {
            if v < MIN_INTERVAL_MINUTES {
                return Err(Error::Validation(format!(
                    "interval_minutes must be at least {MIN_INTERVAL_MINUTES}, got {v}"
                )));
            }
        }
        if let Some(v) = self.page_size {
            if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&v) {
                return Err(Error::Validation(format!(
                    "page_size must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}, got {v}"
                )));
            }
        }
        if let Some(v) = self.retry_attempts {
            if v > MAX_RETRY_ATTEMPTS {
                return Err(Error::Validation(format!(
                    "retry_attempts must be at most {MAX_RETRY_ATTEMPTS}, got {v}"
                )));
            }
        }
        if let Some(v) = self.timeout_minutes {
            if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&v) {
                return Err(Error::Validation(format!(
                    "timeout_minutes must be between {MIN_TIMEOUT_MINUTES} and {MAX_TIMEOUT_MINUTES}, got {v}"
                )));
            }
        }
        Ok(())
    }
}
