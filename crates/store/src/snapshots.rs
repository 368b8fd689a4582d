//! Snapshot reconciliation: batched upserts scoped to a run start time,
//! followed by a soft-delete sweep of rows the run never sighted.
//!
//! The contract (per entity table):
//! - upsert by `(instance_id, upstream_id)`, overwriting fields and setting
//!   `last_synced_at = run_start`; a soft-deleted row that reappears is
//!   undeleted;
//! - after the final page, every row with `last_synced_at < run_start` that
//!   is not yet deleted is soft-deleted.
//!
//! Both halves are idempotent: re-running either with the same inputs
//! changes nothing but `updated_at`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use vp_domain::ids;
use vp_domain::snapshot::{
    CyberArkUser, GroupMembership, UpstreamAuthorizationRecord, UpstreamMembershipRecord,
    UpstreamUserRecord, VaultAuthorization,
};
use vp_domain::sync::SyncCounters;
use vp_domain::Result;

use crate::row::{fmt_dt, parse_dt, parse_opt_dt, parse_opt_json};
use crate::{from_rusqlite, Store};

/// Look up `(id, is_deleted)` for an existing snapshot row.
fn existing_row(
    conn: &Connection,
    table: &str,
    instance_id: &str,
    upstream_id: &str,
) -> Result<Option<(String, bool)>> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        &format!(
            "SELECT id, is_deleted FROM {table} \
             WHERE cyberark_instance_id = ?1 AND upstream_id = ?2"
        ),
        params![instance_id, upstream_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(from_rusqlite)
}

/// Soft-delete rows the run never sighted. Shared across all three tables.
fn sweep_stale(
    conn: &Connection,
    table: &str,
    instance_id: &str,
    run_start: DateTime<Utc>,
) -> Result<u64> {
    let now = fmt_dt(Utc::now());
    let deleted = conn
        .execute(
            &format!(
                "UPDATE {table} SET is_deleted = 1, deleted_at = ?3, updated_at = ?3 \
                 WHERE cyberark_instance_id = ?1 AND last_synced_at < ?2 AND is_deleted = 0"
            ),
            params![instance_id, fmt_dt(run_start), now],
        )
        .map_err(from_rusqlite)?;
    Ok(deleted as u64)
}

impl Store {
    // ── Users ───────────────────────────────────────────────────────

    /// Reconcile one page of upstream users. Returns counters for the page.
    pub async fn reconcile_users_page(
        &self,
        instance_id: String,
        records: Vec<UpstreamUserRecord>,
        run_start: DateTime<Utc>,
    ) -> Result<SyncCounters> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction().map_err(from_rusqlite)?;
            let mut counters = SyncCounters::default();
            let now = fmt_dt(Utc::now());
            let synced_at = fmt_dt(run_start);

            for record in &records {
                match existing_row(&tx, "cyberark_users", &instance_id, &record.upstream_id)? {
                    None => {
                        tx.execute(
                            "INSERT INTO cyberark_users (id, cyberark_instance_id, upstream_id, \
                             username, first_name, last_name, email, user_type, suspended, \
                             is_deleted, last_synced_at, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?11)",
                            params![
                                ids::snapshot_user_id(),
                                instance_id,
                                record.upstream_id,
                                record.username,
                                record.first_name,
                                record.last_name,
                                record.email,
                                record.user_type,
                                record.suspended,
                                synced_at,
                                now,
                            ],
                        )
                        .map_err(from_rusqlite)?;
                        counters.created += 1;
                    }
                    Some((id, _was_deleted)) => {
                        tx.execute(
                            "UPDATE cyberark_users SET username = ?2, first_name = ?3, \
                             last_name = ?4, email = ?5, user_type = ?6, suspended = ?7, \
                             is_deleted = 0, deleted_at = NULL, last_synced_at = ?8, \
                             updated_at = ?9 \
                             WHERE id = ?1",
                            params![
                                id,
                                record.username,
                                record.first_name,
                                record.last_name,
                                record.email,
                                record.user_type,
                                record.suspended,
                                synced_at,
                                now,
                            ],
                        )
                        .map_err(from_rusqlite)?;
                        counters.updated += 1;
                    }
                }
                counters.synced += 1;
            }

            tx.commit().map_err(from_rusqlite)?;
            Ok(counters)
        })
        .await
    }

    /// Sweep after the final users page.
    pub async fn finalize_users_sync(
        &self,
        instance_id: String,
        run_start: DateTime<Utc>,
    ) -> Result<u64> {
        self.call(move |conn| sweep_stale(conn, "cyberark_users", &instance_id, run_start))
            .await
    }

    pub async fn list_snapshot_users(&self, instance_id: String) -> Result<Vec<CyberArkUser>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, cyberark_instance_id, upstream_id, username, first_name, \
                     last_name, email, user_type, suspended, is_deleted, deleted_at, \
                     last_synced_at, created_at, updated_at \
                     FROM cyberark_users WHERE cyberark_instance_id = ?1 \
                     ORDER BY username ASC",
                )
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map(params![instance_id], |row| {
                    Ok(CyberArkUser {
                        id: row.get(0)?,
                        cyberark_instance_id: row.get(1)?,
                        upstream_id: row.get(2)?,
                        username: row.get(3)?,
                        first_name: row.get(4)?,
                        last_name: row.get(5)?,
                        email: row.get(6)?,
                        user_type: row.get(7)?,
                        suspended: row.get(8)?,
                        is_deleted: row.get(9)?,
                        deleted_at: parse_opt_dt(10, row.get(10)?)?,
                        last_synced_at: parse_dt(11, row.get(11)?)?,
                        created_at: parse_dt(12, row.get(12)?)?,
                        updated_at: parse_dt(13, row.get(13)?)?,
                    })
                })
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }

    // ── Group memberships ───────────────────────────────────────────

    pub async fn reconcile_memberships_page(
        &self,
        instance_id: String,
        records: Vec<UpstreamMembershipRecord>,
        run_start: DateTime<Utc>,
    ) -> Result<SyncCounters> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction().map_err(from_rusqlite)?;
            let mut counters = SyncCounters::default();
            let now = fmt_dt(Utc::now());
            let synced_at = fmt_dt(run_start);

            for record in &records {
                match existing_row(&tx, "group_memberships", &instance_id, &record.upstream_id)? {
                    None => {
                        tx.execute(
                            "INSERT INTO group_memberships (id, cyberark_instance_id, \
                             upstream_id, group_name, member_username, member_type, is_deleted, \
                             last_synced_at, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)",
                            params![
                                ids::group_membership_id(),
                                instance_id,
                                record.upstream_id,
                                record.group_name,
                                record.member_username,
                                record.member_type,
                                synced_at,
                                now,
                            ],
                        )
                        .map_err(from_rusqlite)?;
                        counters.created += 1;
                    }
                    Some((id, _)) => {
                        tx.execute(
                            "UPDATE group_memberships SET group_name = ?2, member_username = ?3, \
                             member_type = ?4, is_deleted = 0, deleted_at = NULL, \
                             last_synced_at = ?5, updated_at = ?6 \
                             WHERE id = ?1",
                            params![
                                id,
                                record.group_name,
                                record.member_username,
                                record.member_type,
                                synced_at,
                                now,
                            ],
                        )
                        .map_err(from_rusqlite)?;
                        counters.updated += 1;
                    }
                }
                counters.synced += 1;
            }

            tx.commit().map_err(from_rusqlite)?;
            Ok(counters)
        })
        .await
    }

    pub async fn finalize_memberships_sync(
        &self,
        instance_id: String,
        run_start: DateTime<Utc>,
    ) -> Result<u64> {
        self.call(move |conn| sweep_stale(conn, "group_memberships", &instance_id, run_start))
            .await
    }

    pub async fn list_snapshot_memberships(
        &self,
        instance_id: String,
    ) -> Result<Vec<GroupMembership>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, cyberark_instance_id, upstream_id, group_name, member_username, \
                     member_type, is_deleted, deleted_at, last_synced_at, created_at, updated_at \
                     FROM group_memberships WHERE cyberark_instance_id = ?1 \
                     ORDER BY group_name ASC, member_username ASC",
                )
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map(params![instance_id], |row| {
                    Ok(GroupMembership {
                        id: row.get(0)?,
                        cyberark_instance_id: row.get(1)?,
                        upstream_id: row.get(2)?,
                        group_name: row.get(3)?,
                        member_username: row.get(4)?,
                        member_type: row.get(5)?,
                        is_deleted: row.get(6)?,
                        deleted_at: parse_opt_dt(7, row.get(7)?)?,
                        last_synced_at: parse_dt(8, row.get(8)?)?,
                        created_at: parse_dt(9, row.get(9)?)?,
                        updated_at: parse_dt(10, row.get(10)?)?,
                    })
                })
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }

    // ── Vault authorizations ────────────────────────────────────────

    pub async fn reconcile_authorizations_page(
        &self,
        instance_id: String,
        records: Vec<UpstreamAuthorizationRecord>,
        run_start: DateTime<Utc>,
    ) -> Result<SyncCounters> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction().map_err(from_rusqlite)?;
            let mut counters = SyncCounters::default();
            let now = fmt_dt(Utc::now());
            let synced_at = fmt_dt(run_start);

            for record in &records {
                let permissions = record
                    .permissions
                    .as_ref()
                    .map(|p| serde_json::to_string(p))
                    .transpose()
                    .map_err(|e| vp_domain::Error::Internal(format!("permissions: {e}")))?;
                match existing_row(&tx, "vault_authorizations", &instance_id, &record.upstream_id)?
                {
                    None => {
                        tx.execute(
                            "INSERT INTO vault_authorizations (id, cyberark_instance_id, \
                             upstream_id, safe_name, member_name, permissions, is_deleted, \
                             last_synced_at, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)",
                            params![
                                ids::vault_authorization_id(),
                                instance_id,
                                record.upstream_id,
                                record.safe_name,
                                record.member_name,
                                permissions,
                                synced_at,
                                now,
                            ],
                        )
                        .map_err(from_rusqlite)?;
                        counters.created += 1;
                    }
                    Some((id, _)) => {
                        tx.execute(
                            "UPDATE vault_authorizations SET safe_name = ?2, member_name = ?3, \
                             permissions = ?4, is_deleted = 0, deleted_at = NULL, \
                             last_synced_at = ?5, updated_at = ?6 \
                             WHERE id = ?1",
                            params![id, record.safe_name, record.member_name, permissions, synced_at, now],
                        )
                        .map_err(from_rusqlite)?;
                        counters.updated += 1;
                    }
                }
                counters.synced += 1;
            }

            tx.commit().map_err(from_rusqlite)?;
            Ok(counters)
        })
        .await
    }

    pub async fn finalize_authorizations_sync(
        &self,
        instance_id: String,
        run_start: DateTime<Utc>,
    ) -> Result<u64> {
        self.call(move |conn| sweep_stale(conn, "vault_authorizations", &instance_id, run_start))
            .await
    }

    pub async fn list_snapshot_authorizations(
        &self,
        instance_id: String,
    ) -> Result<Vec<VaultAuthorization>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, cyberark_instance_id, upstream_id, safe_name, member_name, \
                     permissions, is_deleted, deleted_at, last_synced_at, created_at, updated_at \
                     FROM vault_authorizations WHERE cyberark_instance_id = ?1 \
                     ORDER BY safe_name ASC, member_name ASC",
                )
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map(params![instance_id], |row| {
                    Ok(VaultAuthorization {
                        id: row.get(0)?,
                        cyberark_instance_id: row.get(1)?,
                        upstream_id: row.get(2)?,
                        safe_name: row.get(3)?,
                        member_name: row.get(4)?,
                        permissions: parse_opt_json(5, row.get(5)?)?,
                        is_deleted: row.get(6)?,
                        deleted_at: parse_opt_dt(7, row.get(7)?)?,
                        last_synced_at: parse_dt(8, row.get(8)?)?,
                        created_at: parse_dt(9, row.get(9)?)?,
                        updated_at: parse_dt(10, row.get(10)?)?,
                    })
                })
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

    fn user(upstream_id: &str) -> UpstreamUserRecord {
        UpstreamUserRecord {
            upstream_id: upstream_id.into(),
            username: format!("user-{upstream_id}"),
            first_name: None,
            last_name: None,
            email: Some(format!("{upstream_id}@example.com")),
            user_type: Some("EPVUser".into()),
            suspended: false,
        }
    }

    #[tokio::test]
    async fn two_run_reconciliation_soft_deletes_and_revives() {
        let store = store().await;
        let iid = instance(&store).await;

        // Run 1: u1, u2, u3 (two pages of page_size 2).
        let run1 = Utc::now();
        let c1 = store
            .reconcile_users_page(iid.clone(), vec![user("u1"), user("u2")], run1)
            .await
            .unwrap();
        let c2 = store
            .reconcile_users_page(iid.clone(), vec![user("u3")], run1)
            .await
            .unwrap();
        assert_eq!(c1.created + c2.created, 3);
        let swept = store.finalize_users_sync(iid.clone(), run1).await.unwrap();
        assert_eq!(swept, 0);

        let rows = store.list_snapshot_users(iid.clone()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| !r.is_deleted));

        // Run 2: u1, u3, u4 — u2 disappears, u4 appears.
        let run2 = Utc::now();
        store
            .reconcile_users_page(iid.clone(), vec![user("u1"), user("u3")], run2)
            .await
            .unwrap();
        store
            .reconcile_users_page(iid.clone(), vec![user("u4")], run2)
            .await
            .unwrap();
        let swept = store.finalize_users_sync(iid.clone(), run2).await.unwrap();
        assert_eq!(swept, 1);

        let rows = store.list_snapshot_users(iid.clone()).await.unwrap();
        assert_eq!(rows.len(), 4);
        let by_id = |uid: &str| rows.iter().find(|r| r.upstream_id == uid).unwrap();
        assert!(by_id("u2").is_deleted);
        assert!(by_id("u2").deleted_at.is_some());
        assert!(!by_id("u4").is_deleted);
        for uid in ["u1", "u3"] {
            let row = by_id(uid);
            assert!(!row.is_deleted);
            assert_eq!(
                row.last_synced_at.timestamp_micros(),
                run2.timestamp_micros()
            );
        }

        // Run 3: u2 reappears and is undeleted.
        let run3 = Utc::now();
        store
            .reconcile_users_page(
                iid.clone(),
                vec![user("u1"), user("u2"), user("u3"), user("u4")],
                run3,
            )
            .await
            .unwrap();
        store.finalize_users_sync(iid.clone(), run3).await.unwrap();
        let rows = store.list_snapshot_users(iid).await.unwrap();
        let u2 = rows.iter().find(|r| r.upstream_id == "u2").unwrap();
        assert!(!u2.is_deleted);
        assert!(u2.deleted_at.is_none());
    }

    #[tokio::test]
    async fn reconciling_unchanged_set_twice_is_idempotent() {
        let store = store().await;
        let iid = instance(&store).await;

        let run1 = Utc::now();
        store
            .reconcile_users_page(iid.clone(), vec![user("u1"), user("u2")], run1)
            .await
            .unwrap();
        store.finalize_users_sync(iid.clone(), run1).await.unwrap();
        let before = store.list_snapshot_users(iid.clone()).await.unwrap();

        let run2 = Utc::now();
        let counters = store
            .reconcile_users_page(iid.clone(), vec![user("u1"), user("u2")], run2)
            .await
            .unwrap();
        assert_eq!(counters.created, 0);
        assert_eq!(counters.updated, 2);
        store.finalize_users_sync(iid.clone(), run2).await.unwrap();
        let after = store.list_snapshot_users(iid).await.unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.id, a.id, "row identity is stable");
            assert_eq!(b.is_deleted, a.is_deleted);
        }
    }

    #[tokio::test]
    async fn memberships_and_authorizations_reconcile() {
        let store = store().await;
        let iid = instance(&store).await;
        let run = Utc::now();

        store
            .reconcile_memberships_page(
                iid.clone(),
                vec![UpstreamMembershipRecord {
                    upstream_id: "g1:alice".into(),
                    group_name: "Vault Admins".into(),
                    member_username: "alice".into(),
                    member_type: Some("User".into()),
                }],
                run,
            )
            .await
            .unwrap();
        store
            .finalize_memberships_sync(iid.clone(), run)
            .await
            .unwrap();
        let memberships = store.list_snapshot_memberships(iid.clone()).await.unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].group_name, "Vault Admins");

        store
            .reconcile_authorizations_page(
                iid.clone(),
                vec![UpstreamAuthorizationRecord {
                    upstream_id: "PROD-DB:alice".into(),
                    safe_name: "PROD-DB".into(),
                    member_name: "alice".into(),
                    permissions: Some(serde_json::json!({"useAccounts": true})),
                }],
                run,
            )
            .await
            .unwrap();
        store
            .finalize_authorizations_sync(iid.clone(), run)
            .await
            .unwrap();
        let auths = store.list_snapshot_authorizations(iid).await.unwrap();
        assert_eq!(auths.len(), 1);
        assert_eq!(auths[0].permissions.as_ref().unwrap()["useAccounts"], true);
    }

    #[tokio::test]
    async fn sweep_is_scoped_to_the_instance() {
        let store = store().await;
        let iid1 = instance(&store).await;
        let iid2 = store
            .create_instance(
                NewInstance {
                    name: "staging".into(),
                    base_url: "https://staging.example.com".into(),
                    username: "svc".into(),
                    password: "pw".into(),
                    concurrent_sessions: false,
                    skip_tls_verify: false,
                },
                None,
            )
            .await
            .unwrap()
            .id;

        let run = Utc::now();
        store
            .reconcile_users_page(iid1.clone(), vec![user("u1")], run)
            .await
            .unwrap();
        store
            .reconcile_users_page(iid2.clone(), vec![user("u1")], run)
            .await
            .unwrap();

        // A later run on instance 1 with an empty upstream sweeps only its rows.
        let run2 = Utc::now();
        let swept = store.finalize_users_sync(iid1, run2).await.unwrap();
        assert_eq!(swept, 1);
        let other = store.list_snapshot_users(iid2).await.unwrap();
        assert!(!other[0].is_deleted);
    }
}
