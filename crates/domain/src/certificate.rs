//! Custom trust anchors for upstream TLS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered CA record. The PEM blob may hold a single certificate or a
/// chain; every certificate in it must be a CA, and the chain must validate
/// against its own roots before the record is persisted (the upstream crate
/// owns that check).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub id: String,
    pub name: String,
    pub pem: String,
    pub certificate_count: u32,
    /// SHA-256 of the primary certificate's DER, hex-encoded. Unique.
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub is_root_ca: bool,
    pub is_intermediate: bool,
    /// Subjects of every certificate in the blob, primary first.
    pub chain_subjects: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateAuthority {
    /// Whether the primary certificate is currently within its validity
    /// window. Expired CAs are excluded from the trust store.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Input for registering a CA.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCertificateAuthority {
    pub name: String,
    pub pem: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_window() {
        let now = Utc::now();
        let ca = CertificateAuthority {
            id: crate::ids::certificate_authority_id(),
            name: "corp-root".into(),
            pem: String::new(),
            certificate_count: 1,
            fingerprint: "ab".repeat(32),
            subject: "CN=Corp Root".into(),
            issuer: "CN=Corp Root".into(),
            is_root_ca: true,
            is_intermediate: false,
            chain_subjects: vec!["CN=Corp Root".into()],
            not_before: now - chrono::Duration::days(1),
            not_after: now + chrono::Duration::days(1),
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        };
        assert!(ca.is_valid_at(now));
        assert!(!ca.is_valid_at(now + chrono::Duration::days(2)));
        assert!(!ca.is_valid_at(now - chrono::Duration::days(2)));
    }
}
