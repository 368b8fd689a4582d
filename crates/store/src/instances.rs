//! Upstream instance persistence. Creating an instance seeds its three
//! default sync configs; deleting cascades to operations, sync jobs, sync
//! configs, and snapshot rows.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use vp_domain::ids;
use vp_domain::instance::{CyberArkInstance, InstancePatch, NewInstance};
use vp_domain::sync::SyncType;
use vp_domain::{Error, Result};

use crate::row::{fmt_dt, parse_dt, parse_opt_dt};
use crate::{from_rusqlite, Store};

const COLS: &str = "id, name, base_url, username, password_encrypted, concurrent_sessions, \
                    skip_tls_verify, is_active, last_test_at, last_test_success, last_test_error, \
                    created_by, created_at, updated_at";

fn map_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<CyberArkInstance> {
    Ok(CyberArkInstance {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        username: row.get(3)?,
        password_encrypted: row.get(4)?,
        concurrent_sessions: row.get(5)?,
        skip_tls_verify: row.get(6)?,
        is_active: row.get(7)?,
        last_test_at: parse_opt_dt(8, row.get(8)?)?,
        last_test_success: row.get(9)?,
        last_test_error: row.get(10)?,
        created_by: row.get(11)?,
        created_at: parse_dt(12, row.get(12)?)?,
        updated_at: parse_dt(13, row.get(13)?)?,
    })
}

fn get_by_id(conn: &Connection, id: &str) -> Result<CyberArkInstance> {
    conn.query_row(
        &format!("SELECT {COLS} FROM cyberark_instances WHERE id = ?1"),
        params![id],
        map_instance,
    )
    .optional()
    .map_err(from_rusqlite)?
    .ok_or_else(|| Error::NotFound(format!("instance {id}")))
}

/// Same-connection lookup for modules that join instances into their own
/// queries (e.g. the due-config listing).
pub(crate) fn get_instance_in_conn(conn: &Connection, id: &str) -> Result<CyberArkInstance> {
    get_by_id(conn, id)
}

impl Store {
    pub async fn create_instance(
        &self,
        new: NewInstance,
        created_by: Option<String>,
    ) -> Result<CyberArkInstance> {
        new.validate()?;
        // Encrypt outside the executor thread.
        let password_encrypted = self.cipher().encrypt(new.password.as_bytes())?;
        self.call(move |conn| {
            let id = ids::instance_id();
            let now = fmt_dt(Utc::now());
            conn.execute(
                "INSERT INTO cyberark_instances (id, name, base_url, username, \
                 password_encrypted, concurrent_sessions, skip_tls_verify, is_active, \
                 created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?9)",
                params![
                    id,
                    new.name.trim(),
                    new.base_url,
                    new.username,
                    password_encrypted,
                    new.concurrent_sessions,
                    new.skip_tls_verify,
                    created_by,
                    now,
                ],
            )
            .map_err(from_rusqlite)?;

            // Seed the three default sync configs for the new instance.
            for sync_type in SyncType::ALL {
                let cfg = vp_domain::sync::InstanceSyncConfig::defaults(&id, sync_type);
                conn.execute(
                    "INSERT INTO instance_sync_configs (id, cyberark_instance_id, sync_type, \
                     enabled, interval_minutes, page_size, retry_attempts, timeout_minutes, \
                     created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        cfg.id,
                        id,
                        sync_type.as_str(),
                        cfg.enabled,
                        cfg.interval_minutes,
                        cfg.page_size,
                        cfg.retry_attempts,
                        cfg.timeout_minutes,
                        now,
                    ],
                )
                .map_err(from_rusqlite)?;
            }

            get_by_id(conn, &id)
        })
        .await
    }

    pub async fn get_instance(&self, id: &str) -> Result<CyberArkInstance> {
        let id = id.to_string();
        self.call(move |conn| get_by_id(conn, &id)).await
    }

    pub async fn list_instances(&self) -> Result<Vec<CyberArkInstance>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLS} FROM cyberark_instances ORDER BY name ASC"
                ))
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map([], map_instance)
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }

    pub async fn update_instance(
        &self,
        id: String,
        patch: InstancePatch,
        actor: Option<String>,
    ) -> Result<CyberArkInstance> {
        let password_encrypted = match &patch.password {
            Some(password) if !password.is_empty() => {
                Some(self.cipher().encrypt(password.as_bytes())?)
            }
            Some(_) => return Err(Error::Validation("password must not be empty".into())),
            None => None,
        };
        self.call(move |conn| {
            let existing = get_by_id(conn, &id)?;
            if let Some(url) = &patch.base_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(Error::Validation(
                        "base_url must start with http:// or https://".into(),
                    ));
                }
            }
            conn.execute(
                "UPDATE cyberark_instances SET name = ?2, base_url = ?3, username = ?4, \
                 password_encrypted = ?5, concurrent_sessions = ?6, skip_tls_verify = ?7, \
                 is_active = ?8, updated_by = ?9, updated_at = ?10 \
                 WHERE id = ?1",
                params![
                    id,
                    patch.name.unwrap_or(existing.name),
                    patch.base_url.unwrap_or(existing.base_url),
                    patch.username.unwrap_or(existing.username),
                    password_encrypted.unwrap_or(existing.password_encrypted),
                    patch
                        .concurrent_sessions
                        .unwrap_or(existing.concurrent_sessions),
                    patch.skip_tls_verify.unwrap_or(existing.skip_tls_verify),
                    patch.is_active.unwrap_or(existing.is_active),
                    actor,
                    fmt_dt(Utc::now()),
                ],
            )
            .map_err(from_rusqlite)?;
            get_by_id(conn, &id)
        })
        .await
    }

    /// Delete an instance. Foreign keys cascade to operations, sync jobs,
    /// sync configs, and snapshot rows.
    pub async fn delete_instance(&self, id: String) -> Result<()> {
        self.call(move |conn| {
            let changed = conn
                .execute("DELETE FROM cyberark_instances WHERE id = ?1", params![id])
                .map_err(from_rusqlite)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Record the outcome of a connection test.
    pub async fn record_instance_test(
        &self,
        id: String,
        success: bool,
        error: Option<String>,
    ) -> Result<CyberArkInstance> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE cyberark_instances SET last_test_at = ?2, last_test_success = ?3, \
                     last_test_error = ?4, updated_at = ?2 \
                     WHERE id = ?1",
                    params![id, fmt_dt(Utc::now()), success, error],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("instance {id}")));
            }
            get_by_id(conn, &id)
        })
        .await
    }

    /// Decrypt the stored upstream password for an instance.
    pub async fn instance_password(&self, instance: &CyberArkInstance) -> Result<String> {
        self.cipher().decrypt_string(&instance.password_encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store;
    use vp_domain::operation::{NewOperation, OperationType};
    use vp_domain::page::{OperationFilter, PageRequest};

    fn new_instance(name: &str) -> NewInstance {
        NewInstance {
            name: name.into(),
            base_url: "https://vault.example.com".into(),
            username: "svc-orch".into(),
            password: "upstream-pw".into(),
            concurrent_sessions: true,
            skip_tls_verify: false,
        }
    }

    #[tokio::test]
    async fn create_encrypts_password_and_seeds_configs() {
        let store = store().await;
        let instance = store
            .create_instance(new_instance("prod"), None)
            .await
            .unwrap();
        assert!(instance.id.starts_with("cai_"));
        assert_ne!(instance.password_encrypted, b"upstream-pw");

        let plain = store.instance_password(&instance).await.unwrap();
        assert_eq!(plain, "upstream-pw");

        let configs = store
            .get_instance_sync_configs(instance.id.clone())
            .await
            .unwrap();
        assert_eq!(configs.len(), 3);
        assert!(configs.iter().all(|c| c.enabled && c.next_run_at.is_none()));
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let store = store().await;
        store
            .create_instance(new_instance("prod"), None)
            .await
            .unwrap();
        let err = store
            .create_instance(new_instance("prod"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_cascades_to_dependents() {
        let store = store().await;
        let instance = store
            .create_instance(new_instance("prod"), None)
            .await
            .unwrap();

        let mut op = NewOperation::new(OperationType::SafeProvision, serde_json::json!({}));
        op.cyberark_instance_id = Some(instance.id.clone());
        store.create_operation(op).await.unwrap();

        store.delete_instance(instance.id.clone()).await.unwrap();

        assert!(matches!(
            store.get_instance(&instance.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
        let ops = store
            .list_operations(OperationFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(ops.total, 0, "operations cascade with the instance");
        let configs = store.get_instance_sync_configs(instance.id).await.unwrap();
        assert!(configs.is_empty());
    }

    #[tokio::test]
    async fn patch_updates_and_reencrypts() {
        let store = store().await;
        let instance = store
            .create_instance(new_instance("prod"), None)
            .await
            .unwrap();

        let updated = store
            .update_instance(
                instance.id.clone(),
                InstancePatch {
                    name: Some("prod-eu".into()),
                    password: Some("rotated-pw".into()),
                    is_active: Some(false),
                    ..Default::default()
                },
                Some("usr_admin".into()),
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "prod-eu");
        assert!(!updated.is_active);
        assert_eq!(
            store.instance_password(&updated).await.unwrap(),
            "rotated-pw"
        );
    }

    #[tokio::test]
    async fn test_outcome_is_recorded() {
        let store = store().await;
        let instance = store
            .create_instance(new_instance("prod"), None)
            .await
            .unwrap();
        let updated = store
            .record_instance_test(instance.id, false, Some("401 unauthorized".into()))
            .await
            .unwrap();
        assert_eq!(updated.last_test_success, Some(false));
        assert_eq!(updated.last_test_error.as_deref(), Some("401 unauthorized"));
        assert!(updated.last_test_at.is_some());
    }
}
