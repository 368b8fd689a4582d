//! Durable SQLite store — the single source of truth for operations, sync
//! jobs, sync configs, instances, certificate authorities, snapshots, and
//! local accounts.
//!
//! All SQL runs on a dedicated background thread (via `tokio-rusqlite`);
//! callers await results without blocking the runtime. Only SQL and
//! lightweight row mapping belong inside `call()` closures — crypto runs
//! outside, on the caller's task.

mod activity;
mod certificates;
mod crypto;
mod instances;
mod migrations;
mod operations;
mod row;
mod snapshots;
mod sync_configs;
mod sync_jobs;
mod users;

pub use crypto::SecretCipher;
pub use operations::CancelOutcome;

use std::path::Path;

use vp_domain::{Error, Result};

/// Convert an executor error into the shared error type. Unique-constraint
/// violations surface as `Conflict`; everything else is `Storage`.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> Error {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => from_rusqlite(e),
        tokio_rusqlite::Error::Close(_) => Error::Storage("connection closed".to_string()),
        other => Error::Storage(other.to_string()),
    }
}

pub(crate) fn from_rusqlite(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(err, ref msg) = e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict(
                msg.clone().unwrap_or_else(|| "uniqueness violation".to_string()),
            );
        }
    }
    Error::Storage(e.to_string())
}

/// Async store handle. Cheap to clone; all clones share the executor thread.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
    cipher: SecretCipher,
}

impl Store {
    /// Open (or create) the database at `path`, enable WAL mode, and run
    /// migrations. `encryption_key` protects instance passwords at rest.
    pub async fn open(path: &Path, encryption_key: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("creating database directory: {e}")))?;
            }
        }

        let conn = tokio_rusqlite::Connection::open(path.to_path_buf())
            .await
            .map_err(|e| Error::Storage(format!("opening database: {e}")))?;

        let store = Self {
            conn,
            cipher: SecretCipher::from_key_string(encryption_key),
        };
        store.init(true).await?;
        tracing::info!(path = %path.display(), "store ready");
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory(encryption_key: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| Error::Storage(format!("opening in-memory database: {e}")))?;
        let store = Self {
            conn,
            cipher: SecretCipher::from_key_string(encryption_key),
        };
        store.init(false).await?;
        Ok(store)
    }

    async fn init(&self, wal: bool) -> Result<()> {
        self.call(move |conn| {
            if wal {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
                .map_err(from_rusqlite)?;
            }
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA temp_store = MEMORY;",
            )
            .map_err(from_rusqlite)?;
            migrations::run_migrations(conn)
        })
        .await
    }

    pub(crate) fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    /// Run a closure on the executor thread. The closure's own error wins
    /// over transport errors.
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;
        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Health probe: a trivial query round-trip through the executor.
    pub async fn health_check(&self) -> Result<()> {
        self.call(|conn| {
            conn.execute_batch("SELECT 1").map_err(from_rusqlite)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;

    pub const TEST_KEY: &str = "test-encryption-key-0123456789abcdef";

    pub async fn store() -> Store {
        Store::open_in_memory(TEST_KEY).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_and_health_check() {
        let store = test_support::store().await;
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vp.db");
        let store = Store::open(&path, test_support::TEST_KEY).await.unwrap();
        store.health_check().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vp.db");
        {
            let store = Store::open(&path, test_support::TEST_KEY).await.unwrap();
            store.health_check().await.unwrap();
        }
        // Re-opening re-runs the migration gate without error.
        let store = Store::open(&path, test_support::TEST_KEY).await.unwrap();
        store.health_check().await.unwrap();
    }
}
