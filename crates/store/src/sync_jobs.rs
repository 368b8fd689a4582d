//! Sync job persistence and lifecycle.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use vp_domain::ids;
use vp_domain::page::{Page, PageRequest, SyncJobFilter};
use vp_domain::sync::{SyncCounters, SyncJob, SyncJobStatus, SyncType, TriggeredBy};
use vp_domain::{Error, Result};

use crate::row::{fmt_dt, parse_dt, parse_enum, parse_opt_dt};
use crate::{from_rusqlite, Store};

const COLS: &str = "id, cyberark_instance_id, sync_type, status, triggered_by, records_synced, \
                    records_created, records_updated, records_deleted, records_failed, \
                    started_at, completed_at, duration_seconds, error_message, created_at, \
                    updated_at";

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    Ok(SyncJob {
        id: row.get(0)?,
        cyberark_instance_id: row.get(1)?,
        sync_type: parse_enum(2, &row.get::<_, String>(2)?, SyncType::parse)?,
        status: parse_enum(3, &row.get::<_, String>(3)?, SyncJobStatus::parse)?,
        triggered_by: parse_enum(4, &row.get::<_, String>(4)?, TriggeredBy::parse)?,
        records_synced: row.get(5)?,
        records_created: row.get(6)?,
        records_updated: row.get(7)?,
        records_deleted: row.get(8)?,
        records_failed: row.get(9)?,
        started_at: parse_opt_dt(10, row.get(10)?)?,
        completed_at: parse_opt_dt(11, row.get(11)?)?,
        duration_seconds: row.get(12)?,
        error_message: row.get(13)?,
        created_at: parse_dt(14, row.get(14)?)?,
        updated_at: parse_dt(15, row.get(15)?)?,
    })
}

fn get_by_id(conn: &Connection, id: &str) -> Result<SyncJob> {
    conn.query_row(
        &format!("SELECT {COLS} FROM sync_jobs WHERE id = ?1"),
        params![id],
        map_job,
    )
    .optional()
    .map_err(from_rusqlite)?
    .ok_or_else(|| Error::NotFound(format!("sync job {id}")))
}

impl Store {
    pub async fn create_sync_job(
        &self,
        instance_id: String,
        sync_type: SyncType,
        triggered_by: TriggeredBy,
    ) -> Result<SyncJob> {
        self.get_instance(&instance_id).await?;
        self.call(move |conn| {
            let id = ids::sync_job_id();
            let now = fmt_dt(Utc::now());
            conn.execute(
                "INSERT INTO sync_jobs (id, cyberark_instance_id, sync_type, status, \
                 triggered_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
                params![id, instance_id, sync_type.as_str(), triggered_by.as_str(), now],
            )
            .map_err(from_rusqlite)?;
            get_by_id(conn, &id)
        })
        .await
    }

    pub async fn get_sync_job(&self, id: String) -> Result<SyncJob> {
        self.call(move |conn| get_by_id(conn, &id)).await
    }

    pub async fn list_sync_jobs(
        &self,
        filter: SyncJobFilter,
        page: PageRequest,
    ) -> Result<Page<SyncJob>> {
        let page = page.clamped();
        self.call(move |conn| {
            let mut where_clauses: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(instance_id) = &filter.cyberark_instance_id {
                where_clauses.push(format!("cyberark_instance_id = ?{}", args.len() + 1));
                args.push(Box::new(instance_id.clone()));
            }
            if let Some(sync_type) = filter.sync_type {
                where_clauses.push(format!("sync_type = ?{}", args.len() + 1));
                args.push(Box::new(sync_type.as_str()));
            }
            if let Some(status) = filter.status {
                where_clauses.push(format!("status = ?{}", args.len() + 1));
                args.push(Box::new(status.as_str()));
            }

            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            let total: u64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM sync_jobs {where_sql}"),
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    |row| row.get(0),
                )
                .map_err(from_rusqlite)?;

            let sql = format!(
                "SELECT {COLS} FROM sync_jobs {where_sql} \
                 ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
                page.page_size,
                page.offset()
            );
            let mut stmt = conn.prepare(&sql).map_err(from_rusqlite)?;
            let items = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    map_job,
                )
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;

            Ok(Page::new(items, total, page.page, page.page_size))
        })
        .await
    }

    /// The in-flight job for a key, if any. Pending counts: a job that was
    /// created but not yet transitioned still occupies the key.
    pub async fn find_active_sync_job(
        &self,
        instance_id: String,
        sync_type: SyncType,
    ) -> Result<Option<SyncJob>> {
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {COLS} FROM sync_jobs \
                     WHERE cyberark_instance_id = ?1 AND sync_type = ?2 \
                       AND status IN ('pending', 'running') \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![instance_id, sync_type.as_str()],
                map_job,
            )
            .optional()
            .map_err(from_rusqlite)
        })
        .await
    }

    /// `pending → running`, stamping `started_at`.
    pub async fn start_sync_job(&self, id: String) -> Result<SyncJob> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sync_jobs SET status = 'running', started_at = ?2, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, fmt_dt(Utc::now())],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                let job = get_by_id(conn, &id)?;
                return Err(Error::Conflict(format!(
                    "sync job {id} is {} and cannot start",
                    job.status.as_str()
                )));
            }
            get_by_id(conn, &id)
        })
        .await
    }

    /// Overwrite progress counters mid-run. Counters only grow while a run
    /// is in flight; the caller accumulates and hands in totals.
    pub async fn update_sync_job_progress(
        &self,
        id: String,
        counters: SyncCounters,
    ) -> Result<SyncJob> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sync_jobs SET records_synced = ?2, records_created = ?3, \
                     records_updated = ?4, records_deleted = ?5, records_failed = ?6, \
                     updated_at = ?7 \
                     WHERE id = ?1 AND status = 'running'",
                    params![
                        id,
                        counters.synced,
                        counters.created,
                        counters.updated,
                        counters.deleted,
                        counters.failed,
                        fmt_dt(Utc::now()),
                    ],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                let job = get_by_id(conn, &id)?;
                return Err(Error::Conflict(format!(
                    "sync job {id} is {} and cannot record progress",
                    job.status.as_str()
                )));
            }
            get_by_id(conn, &id)
        })
        .await
    }

    /// Terminal transition from `running` with final counters. Duration is
    /// measured from `started_at`.
    pub async fn finish_sync_job(
        &self,
        id: String,
        status: SyncJobStatus,
        counters: SyncCounters,
        error_message: Option<String>,
    ) -> Result<SyncJob> {
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "finish_sync_job called with non-terminal status {}",
                status.as_str()
            )));
        }
        self.call(move |conn| {
            let now = Utc::now();
            let existing = get_by_id(conn, &id)?;
            let duration = existing
                .started_at
                .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
            let changed = conn
                .execute(
                    "UPDATE sync_jobs SET status = ?2, records_synced = ?3, records_created = ?4, \
                     records_updated = ?5, records_deleted = ?6, records_failed = ?7, \
                     completed_at = ?8, duration_seconds = ?9, error_message = ?10, updated_at = ?8 \
                     WHERE id = ?1 AND status IN ('pending', 'running')",
                    params![
                        id,
                        status.as_str(),
                        counters.synced,
                        counters.created,
                        counters.updated,
                        counters.deleted,
                        counters.failed,
                        fmt_dt(now),
                        duration,
                        error_message,
                    ],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                return Err(Error::Conflict(format!(
                    "sync job {id} is {} and cannot finish",
                    existing.status.as_str()
                )));
            }
            get_by_id(conn, &id)
        })
        .await
    }

    /// Startup recovery: jobs left pending/running by a crash are failed.
    /// The scheduler will create fresh jobs at the next tick.
    pub async fn recover_interrupted_sync_jobs(&self) -> Result<Vec<SyncJob>> {
        self.call(move |conn| {
            let now = fmt_dt(Utc::now());
            let mut stmt = conn
                .prepare(&format!(
                    "UPDATE sync_jobs SET status = 'failed', \
                     error_message = 'interrupted by restart', completed_at = ?1, updated_at = ?1 \
                     WHERE status IN ('pending', 'running') \
                     RETURNING {COLS}"
                ))
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map(params![now], map_job)
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store;
    use vp_domain::instance::NewInstance;

    async fn instance(store: &Store) -> String {
        store
            .create_instance(
                NewInstance {
                    name: "prod".into(),
                    base_url: "https://vault.example.com".into(),
                    username: "svc".into(),
                    password: "pw".into(),
                    concurrent_sessions: false,
                    skip_tls_verify: false,
                },
                None,
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn lifecycle_pending_running_completed() {
        let store = store().await;
        let iid = instance(&store).await;
        let job = store
            .create_sync_job(iid.clone(), SyncType::Users, TriggeredBy::Scheduled)
            .await
            .unwrap();
        assert!(job.id.starts_with("sj_"));
        assert_eq!(job.status, SyncJobStatus::Pending);

        let running = store.start_sync_job(job.id.clone()).await.unwrap();
        assert_eq!(running.status, SyncJobStatus::Running);
        assert!(running.started_at.is_some());

        let counters = SyncCounters {
            synced: 3,
            created: 2,
            updated: 1,
            deleted: 0,
            failed: 0,
        };
        let done = store
            .finish_sync_job(job.id.clone(), SyncJobStatus::Completed, counters, None)
            .await
            .unwrap();
        assert_eq!(done.status, SyncJobStatus::Completed);
        assert_eq!(done.records_synced, 3);
        assert!(done.completed_at.is_some());
        assert!(done.duration_seconds.is_some());
    }

    #[tokio::test]
    async fn starting_twice_is_a_conflict() {
        let store = store().await;
        let iid = instance(&store).await;
        let job = store
            .create_sync_job(iid, SyncType::Users, TriggeredBy::Manual)
            .await
            .unwrap();
        store.start_sync_job(job.id.clone()).await.unwrap();
        let err = store.start_sync_job(job.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn active_job_lookup_covers_pending_and_running() {
        let store = store().await;
        let iid = instance(&store).await;
        assert!(store
            .find_active_sync_job(iid.clone(), SyncType::Users)
            .await
            .unwrap()
            .is_none());

        let job = store
            .create_sync_job(iid.clone(), SyncType::Users, TriggeredBy::Scheduled)
            .await
            .unwrap();
        let active = store
            .find_active_sync_job(iid.clone(), SyncType::Users)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, job.id);

        // A different sync type on the same instance is free.
        assert!(store
            .find_active_sync_job(iid.clone(), SyncType::Safes)
            .await
            .unwrap()
            .is_none());

        store.start_sync_job(job.id.clone()).await.unwrap();
        store
            .finish_sync_job(
                job.id,
                SyncJobStatus::Completed,
                SyncCounters::default(),
                None,
            )
            .await
            .unwrap();
        assert!(store
            .find_active_sync_job(iid, SyncType::Users)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn progress_updates_only_while_running() {
        let store = store().await;
        let iid = instance(&store).await;
        let job = store
            .create_sync_job(iid, SyncType::Groups, TriggeredBy::Scheduled)
            .await
            .unwrap();
        let counters = SyncCounters {
            synced: 1,
            ..Default::default()
        };
        let err = store
            .update_sync_job_progress(job.id.clone(), counters)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        store.start_sync_job(job.id.clone()).await.unwrap();
        let updated = store
            .update_sync_job_progress(job.id, counters)
            .await
            .unwrap();
        assert_eq!(updated.records_synced, 1);
    }

    #[tokio::test]
    async fn failed_runs_keep_counters_and_message() {
        let store = store().await;
        let iid = instance(&store).await;
        let job = store
            .create_sync_job(iid, SyncType::Users, TriggeredBy::Scheduled)
            .await
            .unwrap();
        store.start_sync_job(job.id.clone()).await.unwrap();
        let failed = store
            .finish_sync_job(
                job.id,
                SyncJobStatus::Failed,
                SyncCounters {
                    synced: 2,
                    failed: 1,
                    ..Default::default()
                },
                Some("upstream 503".into()),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, SyncJobStatus::Failed);
        assert_eq!(failed.records_failed, 1);
        assert_eq!(failed.error_message.as_deref(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn recovery_fails_interrupted_jobs() {
        let store = store().await;
        let iid = instance(&store).await;
        let job = store
            .create_sync_job(iid.clone(), SyncType::Users, TriggeredBy::Scheduled)
            .await
            .unwrap();
        store.start_sync_job(job.id.clone()).await.unwrap();

        let recovered = store.recover_interrupted_sync_jobs().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, SyncJobStatus::Failed);

        // Key is free again.
        assert!(store
            .find_active_sync_job(iid, SyncType::Users)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_filters_by_instance_and_status() {
        let store = store().await;
        let iid = instance(&store).await;
        for _ in 0..3 {
            let job = store
                .create_sync_job(iid.clone(), SyncType::Users, TriggeredBy::Scheduled)
                .await
                .unwrap();
            store.start_sync_job(job.id.clone()).await.unwrap();
            store
                .finish_sync_job(
                    job.id,
                    SyncJobStatus::Completed,
                    SyncCounters::default(),
                    None,
                )
                .await
                .unwrap();
        }
        store
            .create_sync_job(iid.clone(), SyncType::Safes, TriggeredBy::Manual)
            .await
            .unwrap();

        let all = store
            .list_sync_jobs(
                SyncJobFilter {
                    cyberark_instance_id: Some(iid.clone()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(all.total, 4);

        let completed = store
            .list_sync_jobs(
                SyncJobFilter {
                    cyberark_instance_id: Some(iid),
                    status: Some(SyncJobStatus::Completed),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(completed.total, 3);
    }
}
