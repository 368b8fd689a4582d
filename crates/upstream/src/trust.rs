//! Trust store: an immutable snapshot of extra root certificates layered on
//! top of the TLS backend's built-in roots.
//!
//! The snapshot is swapped atomically under a read/write lock — readers take
//! a cheap `Arc` clone and never wait on a refresh in progress. Refreshes
//! are coalesced: a caller that arrives while another refresh is running
//! waits for it and adopts its result instead of rebuilding again. A failed
//! rebuild keeps the previous snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use vp_domain::certificate::CertificateAuthority;
use vp_domain::Result;

/// Where active CA records come from. The gateway backs this with the
/// store; tests substitute a stub.
#[async_trait]
pub trait CaSource: Send + Sync {
    async fn active_certificate_authorities(&self) -> Result<Vec<CertificateAuthority>>;
}

/// One immutable trust-store generation.
pub struct TrustSnapshot {
    /// Extra roots to install on upstream HTTP clients.
    pub certificates: Vec<reqwest::Certificate>,
    /// Monotonic generation counter; bumps on every successful rebuild.
    pub generation: u64,
    pub refreshed_at: DateTime<Utc>,
    /// Number of CA records that contributed certificates.
    pub ca_count: usize,
}

pub struct TrustStore {
    source: Arc<dyn CaSource>,
    snapshot: RwLock<Arc<TrustSnapshot>>,
    refresh_lock: Mutex<()>,
}

impl TrustStore {
    /// An empty generation-zero store. Call [`refresh`](Self::refresh) once
    /// during startup to load the configured CAs.
    pub fn new(source: Arc<dyn CaSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(TrustSnapshot {
                certificates: Vec::new(),
                generation: 0,
                refreshed_at: Utc::now(),
                ca_count: 0,
            })),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current snapshot. Never blocks behind a refresh.
    pub fn snapshot(&self) -> Arc<TrustSnapshot> {
        self.snapshot.read().clone()
    }

    /// Rebuild the snapshot from the source. Concurrent callers coalesce
    /// onto a single rebuild.
    pub async fn refresh(&self) -> Result<usize> {
        let generation_before = self.snapshot().generation;
        let _guard = self.refresh_lock.lock().await;
        {
            let current = self.snapshot();
            if current.generation != generation_before {
                // Someone else rebuilt while we waited for the lock.
                return Ok(current.ca_count);
            }
        }

        let cas = self.source.active_certificate_authorities().await?;
        let now = Utc::now();
        let mut certificates = Vec::new();
        let mut ca_count = 0usize;

        for ca in &cas {
            if !ca.is_valid_at(now) {
                tracing::warn!(ca_id = %ca.id, name = %ca.name, "skipping expired CA");
                continue;
            }
            // Stored blobs were validated at registration; a parse failure
            // here means on-disk corruption, so skip rather than poison the
            // whole rebuild.
            match reqwest::Certificate::from_pem_bundle(ca.pem.as_bytes()) {
                Ok(parsed) => {
                    certificates.extend(parsed);
                    ca_count += 1;
                }
                Err(e) => {
                    tracing::warn!(ca_id = %ca.id, name = %ca.name, error = %e, "unparseable stored CA blob");
                }
            }
        }

        let next = Arc::new(TrustSnapshot {
            certificates,
            generation: generation_before + 1,
            refreshed_at: now,
            ca_count,
        });
        *self.snapshot.write() = next;

        tracing::info!(
            generation = generation_before + 1,
            ca_count,
            "trust store refreshed"
        );
        Ok(ca_count)
    }
}
