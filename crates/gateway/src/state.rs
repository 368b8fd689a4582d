//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vp_domain::config::AppConfig;
use vp_domain::event::{OperationEvent, SyncJobEvent};
use vp_store::Store;
use vp_upstream::{ClientFactory, TrustStore};

use crate::runtime::{CancelMap, EventBus, SyncEngine};

/// Fields are grouped by concern:
/// - **Core** — config, durable store
/// - **Upstream** — trust store, client factory
/// - **Runtime** — event buses, cancel map, sync engine
/// - **Lifecycle** — process shutdown scope
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<AppConfig>,
    pub store: Store,

    // ── Upstream ──────────────────────────────────────────────────────
    pub trust: Arc<TrustStore>,
    pub factory: Arc<ClientFactory>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub operation_events: EventBus<OperationEvent>,
    pub sync_events: EventBus<SyncJobEvent>,
    pub cancel_map: Arc<CancelMap>,
    pub sync_engine: SyncEngine,

    // ── Lifecycle ─────────────────────────────────────────────────────
    /// Root shutdown scope; SSE streams and in-flight handlers observe it.
    pub shutdown: CancellationToken,
}
