//! Local accounts and sessions.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A local administrator/operator account. `password_hash` is an Argon2id
/// PHC string and never leaves the store layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub is_admin: bool,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An authenticated session, shared by the web UI (cookie) and the CLI
/// (bearer header). Expiry is enforced on every lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Generate a session token: 48 random bytes, hex-encoded.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a random initial admin password (20 chars, unambiguous set).
pub fn generate_admin_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % CHARSET.len();
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tokens_are_long_and_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), 96);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn admin_passwords_avoid_ambiguous_chars() {
        let p = generate_admin_password();
        assert_eq!(p.len(), 20);
        for c in p.chars() {
            assert!(!"0O1lI".contains(c), "ambiguous char {c} in password");
        }
    }

    #[test]
    fn secrets_never_serialize() {
        let now = Utc::now();
        let user = User {
            id: crate::ids::user_id(),
            username: "admin".into(),
            password_hash: "$argon2id$...".into(),
            is_admin: true,
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_hash").is_none());

        let session = Session {
            id: crate::ids::session_id(),
            user_id: user.id.clone(),
            token: generate_session_token(),
            expires_at: now,
            created_at: now,
        };
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("token").is_none());
    }
}
