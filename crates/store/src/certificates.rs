//! Certificate authority persistence. Records arrive pre-validated (the
//! upstream crate enforces the CA/chain invariants); the store enforces
//! uniqueness of name and fingerprint.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use vp_domain::certificate::CertificateAuthority;
use vp_domain::{Error, Result};

use crate::row::{fmt_dt, parse_dt};
use crate::{from_rusqlite, Store};

const COLS: &str = "id, name, pem, certificate_count, fingerprint, subject, issuer, is_root_ca, \
                    is_intermediate, chain_subjects, not_before, not_after, is_active, \
                    created_by, created_at, updated_at";

fn map_ca(row: &rusqlite::Row<'_>) -> rusqlite::Result<CertificateAuthority> {
    let chain_raw: String = row.get(9)?;
    let chain_subjects: Vec<String> = serde_json::from_str(&chain_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(CertificateAuthority {
        id: row.get(0)?,
        name: row.get(1)?,
        pem: row.get(2)?,
        certificate_count: row.get(3)?,
        fingerprint: row.get(4)?,
        subject: row.get(5)?,
        issuer: row.get(6)?,
        is_root_ca: row.get(7)?,
        is_intermediate: row.get(8)?,
        chain_subjects,
        not_before: parse_dt(10, row.get(10)?)?,
        not_after: parse_dt(11, row.get(11)?)?,
        is_active: row.get(12)?,
        created_by: row.get(13)?,
        created_at: parse_dt(14, row.get(14)?)?,
        updated_at: parse_dt(15, row.get(15)?)?,
    })
}

fn get_by_id(conn: &Connection, id: &str) -> Result<CertificateAuthority> {
    conn.query_row(
        &format!("SELECT {COLS} FROM certificate_authorities WHERE id = ?1"),
        params![id],
        map_ca,
    )
    .optional()
    .map_err(from_rusqlite)?
    .ok_or_else(|| Error::NotFound(format!("certificate authority {id}")))
}

impl Store {
    /// Persist a validated CA record. Name and fingerprint collisions are
    /// conflicts.
    pub async fn create_certificate_authority(
        &self,
        ca: CertificateAuthority,
    ) -> Result<CertificateAuthority> {
        self.call(move |conn| {
            let chain = serde_json::to_string(&ca.chain_subjects)
                .map_err(|e| Error::Internal(format!("chain subjects: {e}")))?;
            conn.execute(
                "INSERT INTO certificate_authorities (id, name, pem, certificate_count, \
                 fingerprint, subject, issuer, is_root_ca, is_intermediate, chain_subjects, \
                 not_before, not_after, is_active, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
                params![
                    ca.id,
                    ca.name,
                    ca.pem,
                    ca.certificate_count,
                    ca.fingerprint,
                    ca.subject,
                    ca.issuer,
                    ca.is_root_ca,
                    ca.is_intermediate,
                    chain,
                    fmt_dt(ca.not_before),
                    fmt_dt(ca.not_after),
                    ca.is_active,
                    ca.created_by,
                    fmt_dt(Utc::now()),
                ],
            )
            .map_err(from_rusqlite)?;
            get_by_id(conn, &ca.id)
        })
        .await
    }

    pub async fn get_certificate_authority(&self, id: String) -> Result<CertificateAuthority> {
        self.call(move |conn| get_by_id(conn, &id)).await
    }

    pub async fn list_certificate_authorities(&self) -> Result<Vec<CertificateAuthority>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLS} FROM certificate_authorities ORDER BY name ASC"
                ))
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map([], map_ca)
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }

    /// Active CA records for trust-store assembly. Expiry is the caller's
    /// concern (it knows "now").
    pub async fn list_active_certificate_authorities(
        &self,
    ) -> Result<Vec<CertificateAuthority>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLS} FROM certificate_authorities WHERE is_active = 1 \
                     ORDER BY name ASC"
                ))
                .map_err(from_rusqlite)?;
            let result = stmt
                .query_map([], map_ca)
                .map_err(from_rusqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(from_rusqlite);
            result
        })
        .await
    }

    pub async fn set_certificate_authority_active(
        &self,
        id: String,
        is_active: bool,
        actor: Option<String>,
    ) -> Result<CertificateAuthority> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE certificate_authorities SET is_active = ?2, updated_by = ?3, \
                     updated_at = ?4 WHERE id = ?1",
                    params![id, is_active, actor, fmt_dt(Utc::now())],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("certificate authority {id}")));
            }
            get_by_id(conn, &id)
        })
        .await
    }

    pub async fn delete_certificate_authority(&self, id: String) -> Result<()> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM certificate_authorities WHERE id = ?1",
                    params![id],
                )
                .map_err(from_rusqlite)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("certificate authority {id}")));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::store;

    fn sample(name: &str, fingerprint: &str) -> CertificateAuthority {
        let now = Utc::now();
        CertificateAuthority {
            id: vp_domain::ids::certificate_authority_id(),
            name: name.into(),
            pem: "-----BEGIN CERTIFICATE-----\n...\n-----END CERTIFICATE-----\n".into(),
            certificate_count: 1,
            fingerprint: fingerprint.into(),
            subject: format!("CN={name}"),
            issuer: format!("CN={name}"),
            is_root_ca: true,
            is_intermediate: false,
            chain_subjects: vec![format!("CN={name}")],
            not_before: now - chrono::Duration::days(1),
            not_after: now + chrono::Duration::days(365),
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_list_delete_roundtrip() {
        let store = store().await;
        let ca = store
            .create_certificate_authority(sample("corp-root", "aa11"))
            .await
            .unwrap();
        assert!(ca.id.starts_with("ca_"));

        let all = store.list_certificate_authorities().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chain_subjects, vec!["CN=corp-root"]);

        store
            .delete_certificate_authority(ca.id.clone())
            .await
            .unwrap();
        assert!(matches!(
            store.get_certificate_authority(ca.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_a_conflict() {
        let store = store().await;
        store
            .create_certificate_authority(sample("one", "same-fp"))
            .await
            .unwrap();
        let err = store
            .create_certificate_authority(sample("two", "same-fp"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn deactivated_cas_leave_the_active_list() {
        let store = store().await;
        let ca = store
            .create_certificate_authority(sample("corp-root", "fp1"))
            .await
            .unwrap();
        assert_eq!(
            store
                .list_active_certificate_authorities()
                .await
                .unwrap()
                .len(),
            1
        );

        store
            .set_certificate_authority_active(ca.id, false, None)
            .await
            .unwrap();
        assert!(store
            .list_active_certificate_authorities()
            .await
            .unwrap()
            .is_empty());
    }
}
