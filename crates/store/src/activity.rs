//! Unified activity listing: a UNION of common projections from the
//! operations and sync_jobs tables, ordered newest-first.

use vp_domain::activity::{ActivityFilter, ActivityItem, ActivityKind};
use vp_domain::page::{Page, PageRequest};
use vp_domain::Result;

use crate::row::{parse_dt, parse_opt_dt};
use crate::{from_rusqlite, Store};

fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityItem> {
    let kind_raw: String = row.get(1)?;
    Ok(ActivityItem {
        id: row.get(0)?,
        kind: if kind_raw == "operation" {
            ActivityKind::Operation
        } else {
            ActivityKind::SyncJob
        },
        item_type: row.get(2)?,
        status: row.get(3)?,
        cyberark_instance_id: row.get(4)?,
        error_message: row.get(5)?,
        created_at: parse_dt(6, row.get(6)?)?,
        completed_at: parse_opt_dt(7, row.get(7)?)?,
    })
}

impl Store {
    pub async fn list_activity(
        &self,
        filter: ActivityFilter,
        page: PageRequest,
    ) -> Result<Page<ActivityItem>> {
        let page = page.clamped();
        self.call(move |conn| {
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            let mut arm_filter = |kind_included: bool| -> String {
                let mut clauses: Vec<String> = Vec::new();
                if !kind_included {
                    // This arm is filtered out entirely.
                    clauses.push("0".into());
                }
                if let Some(instance_id) = &filter.cyberark_instance_id {
                    clauses.push(format!("cyberark_instance_id = ?{}", args.len() + 1));
                    args.push(Box::new(instance_id.clone()));
                }
                if let Some(status) = &filter.status {
                    clauses.push(format!("status = ?{}", args.len() + 1));
                    args.push(Box::new(status.clone()));
                }
                if clauses.is_empty() {
                    String::new()
                } else {
                    format!("WHERE {}", clauses.join(" AND "))
                }
            };

            let include_ops = filter.kind.map_or(true, |k| k == ActivityKind::Operation);
            let include_jobs = filter.kind.map_or(true, |k| k == ActivityKind::SyncJob);
            let ops_where = arm_filter(include_ops);
            let jobs_where = arm_filter(include_jobs);

            let union = format!(
                "SELECT id, 'operation' AS kind, type AS item_type, status, \
                        cyberark_instance_id, error_message, created_at, completed_at \
                 FROM operations {ops_where} \
                 UNION ALL \
                 SELECT id, 'sync_job' AS kind, sync_type AS item_type, status, \
                        cyberark_instance_id, error_message, created_at, completed_at \
                 FROM sync_jobs {jobs_where}"
            );

            let total: u64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM ({union})"),
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    |row| row.get(0),
                )
                .map_err(from_rusqlite)?;

            let sql = format!(
                "SELECT * FROM ({union}) ORDER BY created_at DESC, id DESC \
                 LIMIT {} OFFSET {}",
                page.page_size,
                page.offset()
            );
            let mut stmt = conn.prepare(&sql).map_err(from_rusqlite)?;
            let items = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    map_item,
                )
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;

            Ok(Page::new(items, total, page.page, page.page_size))
        })
        .await
    }
}
