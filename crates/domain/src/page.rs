//! Pagination envelope and list filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::{OperationStatus, OperationType, Priority};
use crate::sync::{SyncJobStatus, SyncType};

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_LIST_PAGE_SIZE: u32 = 200;

/// A page of results with its envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, page_size: u32) -> Self {
        let total_pages = if total == 0 {
            0
        } else {
            ((total + page_size as u64 - 1) / page_size as u64) as u32
        };
        Self {
            items,
            total,
            page,
            page_size,
            total_pages,
        }
    }
}

/// Page request, 1-based. Out-of-range values are clamped.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, MAX_LIST_PAGE_SIZE),
        }
    }

    pub fn offset(self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.page_size as u64
    }
}

/// Filters for listing operations.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub op_type: Option<OperationType>,
    pub priority: Option<Priority>,
    /// Matched against id, correlation id, and error message.
    pub search: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub cyberark_instance_id: Option<String>,
}

/// Filters for listing sync jobs.
#[derive(Debug, Clone, Default)]
pub struct SyncJobFilter {
    pub cyberark_instance_id: Option<String>,
    pub sync_type: Option<SyncType>,
    pub status: Option<SyncJobStatus>,
}
