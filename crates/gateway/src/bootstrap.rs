//! Startup wiring: store, trust, seed admin, crash recovery.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use vp_domain::certificate::CertificateAuthority;
use vp_domain::config::AppConfig;
use vp_domain::user::generate_admin_password;
use vp_domain::Result;
use vp_store::Store;
use vp_upstream::CaSource;

/// Backs the trust store with the CA registry table.
pub struct StoreCaSource {
    store: Store,
}

impl StoreCaSource {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CaSource for StoreCaSource {
    async fn active_certificate_authorities(&self) -> Result<Vec<CertificateAuthority>> {
        self.store.list_active_certificate_authorities().await
    }
}

/// Open the store from `DATABASE_URL`. Accepts a plain path or a
/// `sqlite://` / `sqlite:` prefixed URL.
pub async fn open_store(config: &AppConfig) -> Result<Store> {
    let raw = config.database_url.as_str();
    let path = raw
        .strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(raw);
    Store::open(Path::new(path), &config.encryption_key).await
}

/// Seed the initial admin account when the user table is empty. A missing
/// `INITIAL_ADMIN_PASSWORD` generates a random one, logged exactly once —
/// it is not recoverable later.
pub async fn seed_initial_admin(store: &Store, config: &AppConfig) -> Result<()> {
    if store.count_users().await? > 0 {
        return Ok(());
    }

    let (password, generated) = match &config.initial_admin_password {
        Some(password) => (password.clone(), false),
        None => (generate_admin_password(), true),
    };

    let user = store
        .create_user(config.initial_admin_username.clone(), password.clone(), true)
        .await?;

    if generated {
        tracing::warn!(
            username = %user.username,
            password = %password,
            "generated initial admin password — shown only this once"
        );
    } else {
        tracing::info!(username = %user.username, "initial admin account created");
    }
    Ok(())
}

/// Crash recovery for both work queues, run before the loops start.
pub async fn recover_interrupted_work(store: &Store) -> Result<()> {
    let jobs = store.recover_interrupted_sync_jobs().await?;
    if !jobs.is_empty() {
        tracing::warn!(count = jobs.len(), "failed sync jobs interrupted by restart");
    }
    Ok(())
}
