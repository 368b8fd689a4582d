//! Schema migrations, gated on SQLite's `user_version` pragma.
//!
//! Each migration runs once, in order, inside a transaction that also bumps
//! `user_version`. Append-only: never edit a shipped migration.

use rusqlite::Connection;
use vp_domain::{Error, Result};

const MIGRATIONS: &[&str] = &[MIGRATION_1_INITIAL_SCHEMA];

/// Bring the database up to the current schema version.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(storage)?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction().map_err(storage)?;
        tx.execute_batch(sql).map_err(storage)?;
        tx.pragma_update(None, "user_version", version)
            .map_err(storage)?;
        tx.commit().map_err(storage)?;
        tracing::info!(version, "applied store migration");
    }
    Ok(())
}

fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(format!("migration failed: {e}"))
}

const MIGRATION_1_INITIAL_SCHEMA: &str = "
CREATE TABLE users (
    id              TEXT PRIMARY KEY,
    username        TEXT NOT NULL UNIQUE,
    password_hash   TEXT NOT NULL,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    is_active       INTEGER NOT NULL DEFAULT 1,
    last_login_at   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE sessions (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    token           TEXT NOT NULL UNIQUE,
    expires_at      TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX idx_sessions_user ON sessions(user_id);
CREATE INDEX idx_sessions_expires ON sessions(expires_at);

CREATE TABLE cyberark_instances (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    base_url            TEXT NOT NULL,
    username            TEXT NOT NULL,
    password_encrypted  BLOB NOT NULL,
    concurrent_sessions INTEGER NOT NULL DEFAULT 0,
    skip_tls_verify     INTEGER NOT NULL DEFAULT 0,
    is_active           INTEGER NOT NULL DEFAULT 1,
    last_test_at        TEXT,
    last_test_success   INTEGER,
    last_test_error     TEXT,
    created_by          TEXT REFERENCES users(id) ON DELETE SET NULL,
    updated_by          TEXT REFERENCES users(id) ON DELETE SET NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE operations (
    id                   TEXT PRIMARY KEY,
    type                 TEXT NOT NULL,
    priority             TEXT NOT NULL DEFAULT 'normal',
    status               TEXT NOT NULL DEFAULT 'pending',
    payload              TEXT NOT NULL,
    result               TEXT,
    error_message        TEXT,
    retry_count          INTEGER NOT NULL DEFAULT 0,
    max_retries          INTEGER NOT NULL DEFAULT 3,
    scheduled_at         TEXT NOT NULL,
    started_at           TEXT,
    completed_at         TEXT,
    created_by           TEXT REFERENCES users(id) ON DELETE SET NULL,
    updated_by           TEXT REFERENCES users(id) ON DELETE SET NULL,
    cyberark_instance_id TEXT REFERENCES cyberark_instances(id) ON DELETE CASCADE,
    correlation_id       TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);
CREATE INDEX idx_operations_claim ON operations(status, scheduled_at, created_at);
CREATE INDEX idx_operations_instance ON operations(cyberark_instance_id);
CREATE INDEX idx_operations_correlation ON operations(correlation_id);

CREATE TABLE sync_jobs (
    id                   TEXT PRIMARY KEY,
    cyberark_instance_id TEXT NOT NULL REFERENCES cyberark_instances(id) ON DELETE CASCADE,
    sync_type            TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'pending',
    triggered_by         TEXT NOT NULL,
    records_synced       INTEGER NOT NULL DEFAULT 0,
    records_created      INTEGER NOT NULL DEFAULT 0,
    records_updated      INTEGER NOT NULL DEFAULT 0,
    records_deleted      INTEGER NOT NULL DEFAULT 0,
    records_failed       INTEGER NOT NULL DEFAULT 0,
    started_at           TEXT,
    completed_at         TEXT,
    duration_seconds     REAL,
    error_message        TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);
CREATE INDEX idx_sync_jobs_instance ON sync_jobs(cyberark_instance_id, sync_type, status);
CREATE INDEX idx_sync_jobs_created ON sync_jobs(created_at);

CREATE TABLE instance_sync_configs (
    id                   TEXT PRIMARY KEY,
    cyberark_instance_id TEXT NOT NULL REFERENCES cyberark_instances(id) ON DELETE CASCADE,
    sync_type            TEXT NOT NULL,
    enabled              INTEGER NOT NULL DEFAULT 1,
    interval_minutes     INTEGER NOT NULL DEFAULT 60,
    page_size            INTEGER NOT NULL DEFAULT 100,
    retry_attempts       INTEGER NOT NULL DEFAULT 3,
    timeout_minutes      INTEGER NOT NULL DEFAULT 30,
    last_run_at          TEXT,
    last_run_status      TEXT,
    last_run_message     TEXT,
    next_run_at          TEXT,
    updated_by           TEXT REFERENCES users(id) ON DELETE SET NULL,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    UNIQUE (cyberark_instance_id, sync_type)
);

CREATE TABLE certificate_authorities (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    pem               TEXT NOT NULL,
    certificate_count INTEGER NOT NULL,
    fingerprint       TEXT NOT NULL UNIQUE,
    subject           TEXT NOT NULL,
    issuer            TEXT NOT NULL,
    is_root_ca        INTEGER NOT NULL,
    is_intermediate   INTEGER NOT NULL,
    chain_subjects    TEXT NOT NULL,
    not_before        TEXT NOT NULL,
    not_after         TEXT NOT NULL,
    is_active         INTEGER NOT NULL DEFAULT 1,
    created_by        TEXT REFERENCES users(id) ON DELETE SET NULL,
    updated_by        TEXT REFERENCES users(id) ON DELETE SET NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE cyberark_users (
    id                   TEXT PRIMARY KEY,
    cyberark_instance_id TEXT NOT NULL REFERENCES cyberark_instances(id) ON DELETE CASCADE,
    upstream_id          TEXT NOT NULL,
    username             TEXT NOT NULL,
    first_name           TEXT,
    last_name            TEXT,
    email                TEXT,
    user_type            TEXT,
    suspended            INTEGER NOT NULL DEFAULT 0,
    is_deleted           INTEGER NOT NULL DEFAULT 0,
    deleted_at           TEXT,
    last_synced_at       TEXT NOT NULL,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    UNIQUE (cyberark_instance_id, upstream_id)
);
CREATE INDEX idx_cyberark_users_sync ON cyberark_users(cyberark_instance_id, last_synced_at);

CREATE TABLE group_memberships (
    id                   TEXT PRIMARY KEY,
    cyberark_instance_id TEXT NOT NULL REFERENCES cyberark_instances(id) ON DELETE CASCADE,
    upstream_id          TEXT NOT NULL,
    group_name           TEXT NOT NULL,
    member_username      TEXT NOT NULL,
    member_type          TEXT,
    is_deleted           INTEGER NOT NULL DEFAULT 0,
    deleted_at           TEXT,
    last_synced_at       TEXT NOT NULL,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    UNIQUE (cyberark_instance_id, upstream_id)
);
CREATE INDEX idx_group_memberships_sync ON group_memberships(cyberark_instance_id, last_synced_at);

CREATE TABLE vault_authorizations (
    id                   TEXT PRIMARY KEY,
    cyberark_instance_id TEXT NOT NULL REFERENCES cyberark_instances(id) ON DELETE CASCADE,
    upstream_id          TEXT NOT NULL,
    safe_name            TEXT NOT NULL,
    member_name          TEXT NOT NULL,
    permissions          TEXT,
    is_deleted           INTEGER NOT NULL DEFAULT 0,
    deleted_at           TEXT,
    last_synced_at       TEXT NOT NULL,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    UNIQUE (cyberark_instance_id, upstream_id)
);
CREATE INDEX idx_vault_authorizations_sync ON vault_authorizations(cyberark_instance_id, last_synced_at);
";
