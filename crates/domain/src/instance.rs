//! Upstream vault instance configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured upstream CyberArk vault. The stored password is encrypted at
/// rest and never serialized out of the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyberArkInstance {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub username: String,
    /// ChaCha20-Poly1305 ciphertext, nonce prepended. Never exposed.
    #[serde(skip_serializing, default)]
    pub password_encrypted: Vec<u8>,
    /// Ask the vault for a concurrent session on logon.
    pub concurrent_sessions: bool,
    pub skip_tls_verify: bool,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_test_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_test_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_test_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering an instance. The password arrives in plaintext over
/// the API and is encrypted by the store before it touches disk.
#[derive(Debug, Clone, Deserialize)]
pub struct NewInstance {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub concurrent_sessions: bool,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl NewInstance {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::Validation("name must not be empty".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(crate::Error::Validation(
                "base_url must start with http:// or https://".into(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(crate::Error::Validation("username must not be empty".into()));
        }
        if self.password.is_empty() {
            return Err(crate::Error::Validation("password must not be empty".into()));
        }
        Ok(())
    }
}

/// Partial update; absent fields are untouched. A new password re-encrypts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub concurrent_sessions: Option<bool>,
    pub skip_tls_verify: Option<bool>,
    pub is_active: Option<bool>,
}
