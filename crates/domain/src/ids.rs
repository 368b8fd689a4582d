//! Prefixed ULID identifiers.
//!
//! Every primary key is a ULID carrying a short, stable prefix that names the
//! entity kind (`op_01J…`, `sj_01J…`). The prefix is part of the public
//! identifier — clients may rely on it to tell entity kinds apart.

use ulid::Ulid;

/// Operation (`op_`).
pub fn operation_id() -> String {
    prefixed("op")
}

/// Sync job (`sj_`).
pub fn sync_job_id() -> String {
    prefixed("sj")
}

/// Instance sync config (`syncfg_`).
pub fn sync_config_id() -> String {
    prefixed("syncfg")
}

/// CyberArk instance (`cai_`).
pub fn instance_id() -> String {
    prefixed("cai")
}

/// Certificate authority (`ca_`).
pub fn certificate_authority_id() -> String {
    prefixed("ca")
}

/// Local user (`usr_`).
pub fn user_id() -> String {
    prefixed("usr")
}

/// Session (`ses_`).
pub fn session_id() -> String {
    prefixed("ses")
}

/// Snapshot of an upstream user (`cau_`).
pub fn snapshot_user_id() -> String {
    prefixed("cau")
}

/// Snapshot of an upstream group membership (`gm_`).
pub fn group_membership_id() -> String {
    prefixed("gm")
}

/// Snapshot of an upstream vault authorization (`va_`).
pub fn vault_authorization_id() -> String {
    prefixed("va")
}

/// Correlation id grouping related operations (`corr_`).
pub fn correlation_id() -> String {
    prefixed("corr")
}

fn prefixed(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// Check that `id` carries the expected prefix followed by a 26-character
/// ULID. Used by API handlers to reject malformed identifiers early.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    match id.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('_')) {
        Some(ulid) => ulid.len() == 26 && Ulid::from_string(ulid).is_ok(),
        None => false,
    }
}
