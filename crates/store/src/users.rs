//! Local accounts and sessions. Passwords are Argon2id-hashed; hashing runs
//! off the executor thread. Expired sessions are invisible to reads and
//! purged by the hourly janitor.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use vp_domain::ids;
use vp_domain::user::{generate_session_token, Session, User};
use vp_domain::{Error, Result};

use crate::crypto::{hash_password, verify_password};
use crate::row::{fmt_dt, parse_dt, parse_opt_dt};
use crate::{from_rusqlite, Store};

const USER_COLS: &str =
    "id, username, password_hash, is_admin, is_active, last_login_at, created_at, updated_at";

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        is_admin: row.get(3)?,
        is_active: row.get(4)?,
        last_login_at: parse_opt_dt(5, row.get(5)?)?,
        created_at: parse_dt(6, row.get(6)?)?,
        updated_at: parse_dt(7, row.get(7)?)?,
    })
}

fn user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLS} FROM users WHERE username = ?1"),
        params![username],
        map_user,
    )
    .optional()
    .map_err(from_rusqlite)
}

impl Store {
    pub async fn create_user(
        &self,
        username: String,
        password: String,
        is_admin: bool,
    ) -> Result<User> {
        if username.trim().is_empty() {
            return Err(Error::Validation("username must not be empty".into()));
        }
        if password.len() < 8 {
            return Err(Error::Validation(
                "password must be at least 8 characters".into(),
            ));
        }
        // Argon2 is deliberately slow; keep it off the SQL executor thread.
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| Error::Internal(format!("hash task: {e}")))??;

        self.call(move |conn| {
            let id = ids::user_id();
            let now = fmt_dt(Utc::now());
            conn.execute(
                "INSERT INTO users (id, username, password_hash, is_admin, is_active, \
                 created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                params![id, username.trim(), password_hash, is_admin, now],
            )
            .map_err(from_rusqlite)?;
            conn.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id],
                map_user,
            )
            .map_err(from_rusqlite)
        })
        .await
    }

    pub async fn get_user(&self, id: String) -> Result<User> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id],
                map_user,
            )
            .optional()
            .map_err(from_rusqlite)?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
        })
        .await
    }

    pub async fn count_users(&self) -> Result<u64> {
        self.call(|conn| {
            conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                .map_err(from_rusqlite)
        })
        .await
    }

    /// Check credentials and stamp `last_login_at`. Inactive accounts and
    /// unknown usernames fail identically.
    pub async fn verify_credentials(&self, username: String, password: String) -> Result<User> {
        let user = self
            .call(move |conn| user_by_username(conn, &username))
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| Error::Unauthorized("invalid username or password".into()))?;

        let hash = user.password_hash.clone();
        let ok = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| Error::Internal(format!("verify task: {e}")))?;
        if !ok {
            return Err(Error::Unauthorized("invalid username or password".into()));
        }

        let id = user.id.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET last_login_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, fmt_dt(Utc::now())],
            )
            .map_err(from_rusqlite)?;
            Ok(())
        })
        .await?;
        Ok(user)
    }

    /// Delete a user. Sessions cascade; audit references elsewhere are set
    /// to null by the schema's `ON DELETE SET NULL`.
    pub async fn delete_user(&self, id: String) -> Result<()> {
        self.call(move |conn| {
            let changed = conn
                .execute("DELETE FROM users WHERE id = ?1", params![id])
                .map_err(from_rusqlite)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("user {id}")));
            }
            Ok(())
        })
        .await
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub async fn create_session(&self, user_id: String, ttl: std::time::Duration) -> Result<Session> {
        self.call(move |conn| {
            let id = ids::session_id();
            let token = generate_session_token();
            let now = Utc::now();
            let expires_at = now + Duration::from_std(ttl).unwrap_or(Duration::hours(24));
            conn.execute(
                "INSERT INTO sessions (id, user_id, token, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, user_id, token, fmt_dt(expires_at), fmt_dt(now)],
            )
            .map_err(from_rusqlite)?;
            Ok(Session {
                id,
                user_id,
                token,
                expires_at,
                created_at: now,
            })
        })
        .await
    }

    /// Resolve a token to its user. Expired or unknown tokens both come back
    /// unauthorized; expiry is enforced in the query itself.
    pub async fn get_session_user(&self, token: String) -> Result<(Session, User)> {
        self.call(move |conn| {
            let now = fmt_dt(Utc::now());
            conn.query_row(
                &format!(
                    "SELECT s.id, s.user_id, s.token, s.expires_at, s.created_at, {} \
                     FROM sessions s JOIN users u ON u.id = s.user_id \
                     WHERE s.token = ?1 AND s.expires_at > ?2 AND u.is_active = 1",
                    USER_COLS
                        .split(", ")
                        .map(|c| format!("u.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                params![token, now],
                |row| {
                    let session = Session {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        token: row.get(2)?,
                        expires_at: parse_dt(3, row.get(3)?)?,
                        created_at: parse_dt(4, row.get(4)?)?,
                    };
                    let user = User {
                        id: row.get(5)?,
                        username: row.get(6)?,
                        password_hash: row.get(7)?,
                        is_admin: row.get(8)?,
                        is_active: row.get(9)?,
                        last_login_at: parse_opt_dt(10, row.get(10)?)?,
                        created_at: parse_dt(11, row.get(11)?)?,
                        updated_at: parse_dt(12, row.get(12)?)?,
                    };
                    Ok((session, user))
                },
            )
            .optional()
            .map_err(from_rusqlite)?
            .ok_or_else(|| Error::Unauthorized("invalid or expired session".into()))
        })
        .await
    }

    pub async fn delete_session(&self, token: String) -> Result<()> {
        self.call(move |conn| {
            conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
                .map_err(from_rusqlite)?;
            Ok(())
        })
        .await
    }

    /// Janitor sweep: hard-delete expired sessions. Returns rows removed.
    pub async fn purge_expired_sessions(&self) -> Result<u64> {
        self.call(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM sessions WHERE expires_at <= ?1",
                    params![fmt_dt(Utc::now())],
                )
                .map_err(from_rusqlite)?;
            Ok(removed as u64)
        })
        .await
    }
}
