//! Per-(instance, sync_type) schedule persistence.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use vp_domain::sync::{InstanceSyncConfig, SyncConfigPatch, SyncJobStatus, SyncType};
use vp_domain::{Error, Result};

use crate::row::{fmt_dt, parse_dt, parse_opt_dt};
use crate::{from_rusqlite, Store};

const COLS: &str = "id, cyberark_instance_id, sync_type, enabled, interval_minutes, page_size, \
                    retry_attempts, timeout_minutes, last_run_at, last_run_status, \
                    last_run_message, next_run_at, created_at, updated_at";

fn map_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceSyncConfig> {
    let sync_type_raw: String = row.get(2)?;
    let status_raw: Option<String> = row.get(9)?;
    Ok(InstanceSyncConfig {
        id: row.get(0)?,
        cyberark_instance_id: row.get(1)?,
        sync_type: crate::row::parse_enum(2, &sync_type_raw, SyncType::parse)?,
        enabled: row.get(3)?,
        interval_minutes: row.get(4)?,
        page_size: row.get(5)?,
        retry_attempts: row.get(6)?,
        timeout_minutes: row.get(7)?,
        last_run_at: parse_opt_dt(8, row.get(8)?)?,
        last_run_status: status_raw
            .map(|s| crate::row::parse_enum(9, &s, SyncJobStatus::parse))
            .transpose()?,
        last_run_message: row.get(10)?,
        next_run_at: parse_opt_dt(11, row.get(11)?)?,
        created_at: parse_dt(12, row.get(12)?)?,
        updated_at: parse_dt(13, row.get(13)?)?,
    })
}

fn get_by_key(
    conn: &Connection,
    instance_id: &str,
    sync_type: SyncType,
) -> Result<InstanceSyncConfig> {
    conn.query_row(
        &format!(
            "SELECT {COLS} FROM instance_sync_configs \
             WHERE cyberark_instance_id = ?1 AND sync_type = ?2"
        ),
        params![instance_id, sync_type.as_str()],
        map_config,
    )
    .optional()
    .map_err(from_rusqlite)?
    .ok_or_else(|| {
        Error::NotFound(format!(
            "sync config for instance {instance_id}, type {}",
            sync_type.as_str()
        ))
    })
}

impl Store {
    /// All configs for one instance (three rows once the instance exists).
    pub async fn get_instance_sync_configs(
        &self,
        instance_id: String,
    ) -> Result<Vec<InstanceSyncConfig>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLS} FROM instance_sync_configs \
                     WHERE cyberark_instance_id = ?1 ORDER BY sync_type ASC"
                ))
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map(params![instance_id], map_config)
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }

    pub async fn get_sync_config(
        &self,
        instance_id: String,
        sync_type: SyncType,
    ) -> Result<InstanceSyncConfig> {
        self.call(move |conn| get_by_key(conn, &instance_id, sync_type))
            .await
    }

    /// Apply a validated patch. Re-enabling or shrinking the interval takes
    /// effect at the next scheduler tick via `next_run_at` recomputation.
    pub async fn update_sync_config(
        &self,
        instance_id: String,
        sync_type: SyncType,
        patch: SyncConfigPatch,
        actor: Option<String>,
    ) -> Result<InstanceSyncConfig> {
        patch.validate()?;
        self.call(move |conn| {
            let existing = get_by_key(conn, &instance_id, sync_type)?;
            let interval = patch.interval_minutes.unwrap_or(existing.interval_minutes);
            // Keep the invariant next_run_at = last_run_at + interval.
            let next_run_at = existing
                .last_run_at
                .map(|last| last + Duration::minutes(interval as i64));
            conn.execute(
                "UPDATE instance_sync_configs SET enabled = ?3, interval_minutes = ?4, \
                 page_size = ?5, retry_attempts = ?6, timeout_minutes = ?7, next_run_at = ?8, \
                 updated_by = ?9, updated_at = ?10 \
                 WHERE cyberark_instance_id = ?1 AND sync_type = ?2",
                params![
                    instance_id,
                    sync_type.as_str(),
                    patch.enabled.unwrap_or(existing.enabled),
                    interval,
                    patch.page_size.unwrap_or(existing.page_size),
                    patch.retry_attempts.unwrap_or(existing.retry_attempts),
                    patch.timeout_minutes.unwrap_or(existing.timeout_minutes),
                    next_run_at.map(fmt_dt),
                    actor,
                    fmt_dt(Utc::now()),
                ],
            )
            .map_err(from_rusqlite)?;
            get_by_key(conn, &instance_id, sync_type)
        })
        .await
    }

    /// Configs that are due: enabled and `next_run_at` unset or in the past,
    /// with the instance record loaded eagerly. Inactive instances are
    /// skipped.
    pub async fn list_due_sync_configs(
        &self,
    ) -> Result<Vec<(InstanceSyncConfig, vp_domain::instance::CyberArkInstance)>> {
        self.call(move |conn| {
            let now = fmt_dt(Utc::now());
            let mut stmt = conn
                .prepare(
                    "SELECT c.id FROM instance_sync_configs c \
                     JOIN cyberark_instances i ON i.id = c.cyberark_instance_id \
                     WHERE c.enabled = 1 AND i.is_active = 1 \
                       AND (c.next_run_at IS NULL OR c.next_run_at <= ?1) \
                     ORDER BY c.next_run_at ASC",
                )
                .map_err(from_rusqlite)?;
            let ids: Vec<String> = stmt
                .query_map(params![now], |row| row.get(0))
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite)?;

            let mut due = Vec::with_capacity(ids.len());
            for id in ids {
                let config = conn
                    .query_row(
                        &format!("SELECT {COLS} FROM instance_sync_configs WHERE id = ?1"),
                        params![id],
                        map_config,
                    )
                    .map_err(from_rusqlite)?;
                let instance =
                    crate::instances::get_instance_in_conn(conn, &config.cyberark_instance_id)?;
                due.push((config, instance));
            }
            Ok(due)
        })
        .await
    }

    /// Record a finished run on the config: stamps `last_run_*` and pushes
    /// `next_run_at` out by the interval. Called on success and on failure —
    /// a failed run still schedules the next attempt.
    pub async fn record_sync_run(
        &self,
        instance_id: String,
        sync_type: SyncType,
        finished_at: DateTime<Utc>,
        status: SyncJobStatus,
        message: Option<String>,
    ) -> Result<InstanceSyncConfig> {
        self.call(move |conn| {
            let existing = get_by_key(conn, &instance_id, sync_type)?;
            let next = finished_at + Duration::minutes(existing.interval_minutes as i64);
            conn.execute(
                "UPDATE instance_sync_configs SET last_run_at = ?3, last_run_status = ?4, \
                 last_run_message = ?5, next_run_at = ?6, updated_at = ?7 \
                 WHERE cyberark_instance_id = ?1 AND sync_type = ?2",
                params![
                    instance_id,
                    sync_type.as_str(),
                    fmt_dt(finished_at),
                    status.as_str(),
                    message,
                    fmt_dt(next),
                    fmt_dt(Utc::now()),
                ],
            )
            .map_err(from_rusqlite)?;
            get_by_key(conn, &instance_id, sync_type)
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
    async fn fresh_configs_are_due() {
        let store = store().await;
        let id = instance(&store).await;
        let due = store.list_due_sync_configs().await.unwrap();
        assert_eq!(due.len(), 3);
        assert!(due.iter().all(|(c, i)| c.cyberark_instance_id == id && i.id == id));
    }

    #[tokio::test]
    async fn recording_a_run_pushes_next_run_out() {
        let store = store().await;
        let id = instance(&store).await;
        let finished = Utc::now();
        let cfg = store
            .record_sync_run(
                id.clone(),
                SyncType::Users,
                finished,
                SyncJobStatus::Completed,
                Some("synced 3 records".into()),
            )
            .await
            .unwrap();
        assert_eq!(cfg.last_run_status, Some(SyncJobStatus::Completed));
        let next = cfg.next_run_at.unwrap();
        assert_eq!(
            (next - finished).num_minutes(),
            cfg.interval_minutes as i64
        );

        // The users config is no longer due; the other two still are.
        let due = store.list_due_sync_configs().await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|(c, _)| c.sync_type != SyncType::Users));
    }

    #[tokio::test]
    async fn failed_runs_still_schedule_the_next_attempt() {
        let store = store().await;
        let id = instance(&store).await;
        let cfg = store
            .record_sync_run(
                id,
                SyncType::Safes,
                Utc::now(),
                SyncJobStatus::Failed,
                Some("upstream 503".into()),
            )
            .await
            .unwrap();
        assert_eq!(cfg.last_run_status, Some(SyncJobStatus::Failed));
        assert!(cfg.next_run_at.is_some());
    }

    #[tokio::test]
    async fn patch_validates_and_applies() {
        let store = store().await;
        let id = instance(&store).await;

        let err = store
            .update_sync_config(
                id.clone(),
                SyncType::Users,
                SyncConfigPatch {
                    interval_minutes: Some(1),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let cfg = store
            .update_sync_config(
                id.clone(),
                SyncType::Users,
                SyncConfigPatch {
                    enabled: Some(false),
                    interval_minutes: Some(15),
                    page_size: Some(50),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.interval_minutes, 15);
        assert_eq!(cfg.page_size, 50);

        // Disabled configs drop out of the due list.
        let due = store.list_due_sync_configs().await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn interval_patch_recomputes_next_run_from_last_run() {
        let store = store().await;
        let id = instance(&store).await;
        let finished = Utc::now() - Duration::minutes(30);
        store
            .record_sync_run(
                id.clone(),
                SyncType::Groups,
                finished,
                SyncJobStatus::Completed,
                None,
            )
            .await
            .unwrap();

        let cfg = store
            .update_sync_config(
                id,
                SyncType::Groups,
                SyncConfigPatch {
                    interval_minutes: Some(10),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        // next_run_at = last_run_at + new interval, which is already past.
        let next = cfg.next_run_at.unwrap();
        assert_eq!((next - finished).num_minutes(), 10);
        assert!(cfg.is_due(Utc::now()));
    }

    #[tokio::test]
    async fn missing_config_is_not_found() {
        let store = store().await;
        let err = store
            .get_sync_config("cai_missing".into(), SyncType::Users)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
