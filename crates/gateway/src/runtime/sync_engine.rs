//! Sync engine: executes one sync run — logon, paginate, reconcile page by
//! page against the run start time, sweep, record counters and schedule the
//! next run. Both the scheduler and sync-typed operations come through
//! here, so the per-(instance, sync_type) single-flight rule lives here
//! too.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use vp_domain::event::SyncJobEvent;
use vp_domain::instance::CyberArkInstance;
use vp_domain::snapshot::{
    UpstreamAuthorizationRecord, UpstreamMembershipRecord, UpstreamUserRecord,
};
use vp_domain::sync::{InstanceSyncConfig, SyncCounters, SyncJob, SyncJobStatus, SyncType, TriggeredBy};
use vp_domain::{Error, Result};
use vp_store::Store;
use vp_upstream::{ClientFactory, UpstreamPage, VaultSession};

use super::events::EventBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vault gateway seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An open, authenticated view of one vault's inventories. Production wraps
/// a [`VaultSession`]; tests substitute scripted pages.
#[async_trait]
pub trait VaultInventory: Send + Sync {
    async fn list_users(
        &self,
        offset: u64,
        page_size: u32,
    ) -> Result<UpstreamPage<UpstreamUserRecord>>;
    async fn list_safe_authorizations(
        &self,
        offset: u64,
        page_size: u32,
    ) -> Result<UpstreamPage<UpstreamAuthorizationRecord>>;
    async fn list_group_memberships(
        &self,
        offset: u64,
        page_size: u32,
    ) -> Result<UpstreamPage<UpstreamMembershipRecord>>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens authenticated inventories for an instance.
#[async_trait]
pub trait VaultGateway: Send + Sync {
    async fn open_inventory(
        &self,
        instance: &CyberArkInstance,
    ) -> Result<Box<dyn VaultInventory>>;
}

/// Production gateway: decrypt the instance credential, build a client
/// against the current trust snapshot, log on.
pub struct UpstreamVaultGateway {
    factory: Arc<ClientFactory>,
    store: Store,
}

impl UpstreamVaultGateway {
    pub fn new(factory: Arc<ClientFactory>, store: Store) -> Self {
        Self { factory, store }
    }
}

#[async_trait]
impl VaultGateway for UpstreamVaultGateway {
    async fn open_inventory(
        &self,
        instance: &CyberArkInstance,
    ) -> Result<Box<dyn VaultInventory>> {
        let password = self.store.instance_password(instance).await?;
        let client = self.factory.client_for_instance(instance, password)?;
        let session = client.logon().await?;
        Ok(Box::new(SessionInventory { session }))
    }
}

struct SessionInventory {
    session: VaultSession,
}

#[async_trait]
impl VaultInventory for SessionInventory {
    async fn list_users(
        &self,
        offset: u64,
        page_size: u32,
    ) -> Result<UpstreamPage<UpstreamUserRecord>> {
        Ok(self.session.list_users(offset, page_size).await?)
    }

    async fn list_safe_authorizations(
        &self,
        offset: u64,
        page_size: u32,
    ) -> Result<UpstreamPage<UpstreamAuthorizationRecord>> {
        Ok(self.session.list_safe_authorizations(offset, page_size).await?)
    }

    async fn list_group_memberships(
        &self,
        offset: u64,
        page_size: u32,
    ) -> Result<UpstreamPage<UpstreamMembershipRecord>> {
        Ok(self.session.list_group_memberships(offset, page_size).await?)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(self.session.logoff().await?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single-flight key guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type SyncKey = (String, SyncType);

struct KeyGuard {
    keys: Arc<Mutex<HashSet<SyncKey>>>,
    key: SyncKey,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SyncEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct SyncEngine {
    store: Store,
    gateway: Arc<dyn VaultGateway>,
    events: EventBus<SyncJobEvent>,
    /// Bounds concurrent runs across all keys.
    workers: Arc<Semaphore>,
    /// In-flight (instance, sync_type) keys. Two runs for the same key are
    /// never concurrent.
    keys: Arc<Mutex<HashSet<SyncKey>>>,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        gateway: Arc<dyn VaultGateway>,
        events: EventBus<SyncJobEvent>,
        parallelism: usize,
    ) -> Self {
        Self {
            store,
            gateway,
            events,
            workers: Arc::new(Semaphore::new(parallelism.max(1))),
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn events(&self) -> &EventBus<SyncJobEvent> {
        &self.events
    }

    fn claim_key(&self, instance_id: &str, sync_type: SyncType) -> Option<KeyGuard> {
        let key = (instance_id.to_string(), sync_type);
        let mut keys = self.keys.lock();
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(KeyGuard {
            keys: self.keys.clone(),
            key,
        })
    }

    /// Create a job for the key and execute it on a background worker.
    /// Returns the pending job immediately, or `Conflict` when a run for
    /// the key is already in flight.
    pub async fn trigger(
        &self,
        instance_id: String,
        sync_type: SyncType,
        triggered_by: TriggeredBy,
        shutdown: CancellationToken,
    ) -> Result<SyncJob> {
        let (job, config, instance, guard) =
            self.prepare(instance_id, sync_type, triggered_by).await?;

        let engine = self.clone();
        let background_job = job.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match engine.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            engine
                .execute(background_job, config, instance, shutdown)
                .await;
        });

        Ok(job)
    }

    /// Create a job and wait for its run to finish (used by sync-typed
    /// operations). Same single-flight rule as [`trigger`](Self::trigger).
    ///
    /// The run itself executes on a spawned task: if the caller's future is
    /// dropped (an operation deadline, say), the run still reaches a
    /// terminal state instead of leaving a `running` row holding the key.
    /// Cancellation is signalled through `cancel`, not by dropping.
    pub async fn run_inline(
        &self,
        instance_id: String,
        sync_type: SyncType,
        triggered_by: TriggeredBy,
        cancel: CancellationToken,
    ) -> Result<SyncJob> {
        let (job, config, instance, guard) =
            self.prepare(instance_id, sync_type, triggered_by).await?;

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = match engine.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(Error::Internal("sync worker pool closed".into())),
            };
            Ok(engine.execute(job, config, instance, cancel).await)
        });
        handle
            .await
            .map_err(|e| Error::Internal(format!("sync run task: {e}")))?
    }

    /// Shared setup: claim the key, re-check the store for an active job,
    /// load config and instance, create the pending job.
    async fn prepare(
        &self,
        instance_id: String,
        sync_type: SyncType,
        triggered_by: TriggeredBy,
    ) -> Result<(SyncJob, InstanceSyncConfig, CyberArkInstance, KeyGuard)> {
        let guard = self.claim_key(&instance_id, sync_type).ok_or_else(|| {
            Error::Conflict(format!(
                "{} sync already in flight for instance {instance_id}",
                sync_type.as_str()
            ))
        })?;

        // The in-memory key covers this process; the store check covers jobs
        // that predate it (e.g. created just before a crash).
        if let Some(active) = self
            .store
            .find_active_sync_job(instance_id.clone(), sync_type)
            .await?
        {
            return Err(Error::Conflict(format!(
                "{} sync already running for instance {instance_id}: {}",
                sync_type.as_str(),
                active.id
            )));
        }

        let config = self
            .store
            .get_sync_config(instance_id.clone(), sync_type)
            .await?;
        let instance = self.store.get_instance(&instance_id).await?;
        let job = self
            .store
            .create_sync_job(instance_id, sync_type, triggered_by)
            .await?;
        self.events.publish(SyncJobEvent::created(job.clone()));

        Ok((job, config, instance, guard))
    }

    /// Drive one created job to a terminal state. Never returns an error:
    /// failures are recorded on the job and the config.
    async fn execute(
        &self,
        job: SyncJob,
        config: InstanceSyncConfig,
        instance: CyberArkInstance,
        cancel: CancellationToken,
    ) -> SyncJob {
        let job = match self.store.start_sync_job(job.id.clone()).await {
            Ok(job) => {
                self.events.publish(SyncJobEvent::updated(job.clone()));
                job
            }
            Err(e) => {
                tracing::warn!(sync_job_id = %job.id, error = %e, "sync job could not start");
                return job;
            }
        };

        let deadline = Duration::from_secs(config.timeout_minutes as u64 * 60);
        let mut counters = SyncCounters::default();
        let outcome = tokio::time::timeout(
            deadline,
            self.run(&job, &config, &instance, &cancel, &mut counters),
        )
        .await;

        let (status, message) = match outcome {
            Ok(Ok(())) => (
                SyncJobStatus::Completed,
                format!("synced {} records", counters.synced),
            ),
            Ok(Err(e)) if cancel.is_cancelled() => {
                (SyncJobStatus::Cancelled, format!("cancelled: {e}"))
            }
            Ok(Err(e)) => (SyncJobStatus::Failed, e.to_string()),
            Err(_) => (
                SyncJobStatus::Failed,
                format!("timed out after {} minutes", config.timeout_minutes),
            ),
        };

        let error_message =
            (status != SyncJobStatus::Completed).then(|| message.clone());
        let finished = match self
            .store
            .finish_sync_job(job.id.clone(), status, counters, error_message)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(sync_job_id = %job.id, error = %e, "recording sync result failed");
                return job;
            }
        };

        if let Err(e) = self
            .store
            .record_sync_run(
                finished.cyberark_instance_id.clone(),
                finished.sync_type,
                Utc::now(),
                status,
                Some(message.clone()),
            )
            .await
        {
            tracing::warn!(sync_job_id = %finished.id, error = %e, "updating sync config failed");
        }

        self.events.publish(SyncJobEvent::updated(finished.clone()));
        match status {
            SyncJobStatus::Completed => tracing::info!(
                sync_job_id = %finished.id,
                instance_id = %finished.cyberark_instance_id,
                sync_type = finished.sync_type.as_str(),
                synced = counters.synced,
                created = counters.created,
                updated = counters.updated,
                deleted = counters.deleted,
                "sync run completed"
            ),
            _ => tracing::warn!(
                sync_job_id = %finished.id,
                instance_id = %finished.cyberark_instance_id,
                sync_type = finished.sync_type.as_str(),
                status = status.as_str(),
                message = %message,
                "sync run did not complete"
            ),
        }
        finished
    }

    /// The pagination/reconciliation loop. Counters accumulate in
    /// `counters` so a failure still reports partial progress.
    async fn run(
        &self,
        job: &SyncJob,
        config: &InstanceSyncConfig,
        instance: &CyberArkInstance,
        cancel: &CancellationToken,
        counters: &mut SyncCounters,
    ) -> Result<()> {
        let inventory = self.gateway.open_inventory(instance).await?;
        let run_start = Utc::now();
        let instance_id = instance.id.clone();
        let mut offset: u64 = 0;

        let result = loop {
            if cancel.is_cancelled() {
                break Err(Error::Internal("cancelled".into()));
            }

            let (page_counters, consumed, has_more) = match job.sync_type {
                SyncType::Users => {
                    let page = match inventory.list_users(offset, config.page_size).await {
                        Ok(page) => page,
                        Err(e) => break Err(e),
                    };
                    let consumed = page.consumed;
                    let has_more = page.has_more(offset + consumed);
                    let page_counters = match self
                        .store
                        .reconcile_users_page(instance_id.clone(), page.items, run_start)
                        .await
                    {
                        Ok(c) => c,
                        Err(e) => break Err(e),
                    };
                    (page_counters, consumed, has_more)
                }
                SyncType::Safes => {
                    let page = match inventory
                        .list_safe_authorizations(offset, config.page_size)
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => break Err(e),
                    };
                    let consumed = page.consumed;
                    let has_more = page.has_more(offset + consumed);
                    let page_counters = match self
                        .store
                        .reconcile_authorizations_page(instance_id.clone(), page.items, run_start)
                        .await
                    {
                        Ok(c) => c,
                        Err(e) => break Err(e),
                    };
                    (page_counters, consumed, has_more)
                }
                SyncType::Groups => {
                    let page = match inventory
                        .list_group_memberships(offset, config.page_size)
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => break Err(e),
                    };
                    let consumed = page.consumed;
                    let has_more = page.has_more(offset + consumed);
                    let page_counters = match self
                        .store
                        .reconcile_memberships_page(instance_id.clone(), page.items, run_start)
                        .await
                    {
                        Ok(c) => c,
                        Err(e) => break Err(e),
                    };
                    (page_counters, consumed, has_more)
                }
            };

            counters.add(page_counters);
            offset += consumed;
            if let Err(e) = self
                .store
                .update_sync_job_progress(job.id.clone(), *counters)
                .await
            {
                tracing::warn!(sync_job_id = %job.id, error = %e, "progress update failed");
            }
            if !has_more {
                break Ok(());
            }
        };

        if result.is_ok() {
            let swept = match job.sync_type {
                SyncType::Users => {
                    self.store
                        .finalize_users_sync(instance_id.clone(), run_start)
                        .await?
                }
                SyncType::Safes => {
                    self.store
                        .finalize_authorizations_sync(instance_id.clone(), run_start)
                        .await?
                }
                SyncType::Groups => {
                    self.store
                        .finalize_memberships_sync(instance_id.clone(), run_start)
                        .await?
                }
            };
            counters.deleted += swept;
        }

        if let Err(e) = inventory.close().await {
            tracing::warn!(sync_job_id = %job.id, error = %e, "upstream logoff failed");
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use vp_domain::instance::NewInstance;

    pub(crate) const TEST_KEY: &str = "test-encryption-key-0123456789abcdef";

    /// Scripted inventory: each call to `open_inventory` serves the next
    /// run's record set, paginated by the requested page size.
    pub(crate) struct ScriptedGateway {
        runs: Mutex<Vec<Vec<UpstreamUserRecord>>>,
        pub delay: Option<Duration>,
        pub fail_logon: Mutex<bool>,
    }

    impl ScriptedGateway {
        pub fn new(runs: Vec<Vec<UpstreamUserRecord>>) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(runs),
                delay: None,
                fail_logon: Mutex::new(false),
            })
        }

        pub fn with_delay(runs: Vec<Vec<UpstreamUserRecord>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(runs),
                delay: Some(delay),
                fail_logon: Mutex::new(false),
            })
        }
    }

    pub(crate) fn user(upstream_id: &str) -> UpstreamUserRecord {
        UpstreamUserRecord {
            upstream_id: upstream_id.into(),
            username: format!("user-{upstream_id}"),
            first_name: None,
            last_name: None,
            email: None,
            user_type: None,
            suspended: false,
        }
    }

    struct ScriptedInventory {
        records: Vec<UpstreamUserRecord>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl VaultGateway for ScriptedGateway {
        async fn open_inventory(
            &self,
            _instance: &CyberArkInstance,
        ) -> Result<Box<dyn VaultInventory>> {
            if *self.fail_logon.lock() {
                return Err(Error::UpstreamTransient("logon refused".into()));
            }
            let mut runs = self.runs.lock();
            let records = if runs.is_empty() {
                Vec::new()
            } else {
                runs.remove(0)
            };
            Ok(Box::new(ScriptedInventory {
                records,
                delay: self.delay,
            }))
        }
    }

    #[async_trait]
    impl VaultInventory for ScriptedInventory {
        async fn list_users(
            &self,
            offset: u64,
            page_size: u32,
        ) -> Result<UpstreamPage<UpstreamUserRecord>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let start = offset as usize;
            let end = (start + page_size as usize).min(self.records.len());
            let items: Vec<_> = self.records[start.min(self.records.len())..end].to_vec();
            Ok(UpstreamPage {
                consumed: items.len() as u64,
                total: self.records.len() as u64,
                items,
            })
        }

        async fn list_safe_authorizations(
            &self,
            _offset: u64,
            _page_size: u32,
        ) -> Result<UpstreamPage<UpstreamAuthorizationRecord>> {
            Ok(UpstreamPage {
                items: Vec::new(),
                consumed: 0,
                total: 0,
            })
        }

        async fn list_group_memberships(
            &self,
            _offset: u64,
            _page_size: u32,
        ) -> Result<UpstreamPage<UpstreamMembershipRecord>> {
            Ok(UpstreamPage {
                items: Vec::new(),
                consumed: 0,
                total: 0,
            })
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) async fn store_with_instance() -> (Store, String) {
        let store = Store::open_in_memory(TEST_KEY).await.unwrap();
        let instance = store
            .create_instance(
                NewInstance {
                    name: "prod".into(),
                    base_url: "https://vault.example.com".into(),
                    username: "svc".into(),
                    password: "pw".into(),
                    concurrent_sessions: false,
                    skip_tls_verify: false,
                },
                None,
            )
            .await
            .unwrap();
        (store, instance.id)
    }

    fn engine(store: Store, gateway: Arc<ScriptedGateway>) -> SyncEngine {
        SyncEngine::new(store, gateway, EventBus::new("sync-test"), 4)
    }

    #[tokio::test]
    async fn two_runs_reconcile_with_soft_deletes() {
        let (store, iid) = store_with_instance().await;
        // Page size 2 forces two pages on the first run.
        store
            .update_sync_config(
                iid.clone(),
                SyncType::Users,
                vp_domain::sync::SyncConfigPatch {
                    page_size: Some(2),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let gateway = ScriptedGateway::new(vec![
            vec![user("u1"), user("u2"), user("u3")],
            vec![user("u1"), user("u3"), user("u4")],
        ]);
        let engine = engine(store.clone(), gateway);
        let mut events = engine.events().subscribe();

        let run1 = engine
            .run_inline(
                iid.clone(),
                SyncType::Users,
                TriggeredBy::Manual,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run1.status, SyncJobStatus::Completed);
        assert_eq!(run1.records_synced, 3);
        assert_eq!(run1.records_created, 3);
        assert_eq!(run1.records_deleted, 0);
        assert!(run1.duration_seconds.is_some());

        let run2 = engine
            .run_inline(
                iid.clone(),
                SyncType::Users,
                TriggeredBy::Manual,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run2.status, SyncJobStatus::Completed);
        assert_eq!(run2.records_synced, 3);
        assert_eq!(run2.records_created, 1, "only u4 is new");
        assert_eq!(run2.records_updated, 2);
        assert_eq!(run2.records_deleted, 1, "u2 is swept");

        let rows = store.list_snapshot_users(iid.clone()).await.unwrap();
        let find = |id: &str| rows.iter().find(|r| r.upstream_id == id).unwrap();
        assert!(find("u2").is_deleted);
        assert!(!find("u1").is_deleted);
        assert!(!find("u4").is_deleted);

        // Config bookkeeping: next run is scheduled.
        let config = store
            .get_sync_config(iid, SyncType::Users)
            .await
            .unwrap();
        assert_eq!(config.last_run_status, Some(SyncJobStatus::Completed));
        assert!(config.next_run_at.unwrap() > Utc::now());

        // Event order per run: sync_created, then running, then terminal.
        use vp_domain::event::SyncJobEventType::*;
        let mut seen = Vec::new();
        while let Some(event) = events.try_recv() {
            seen.push((event.event_type, event.sync_job.status));
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0].0, SyncCreated);
        assert_eq!(seen[1], (SyncUpdated, SyncJobStatus::Running));
        assert_eq!(seen[2], (SyncUpdated, SyncJobStatus::Completed));
        assert_eq!(seen[3].0, SyncCreated);
    }

    #[tokio::test]
    async fn same_key_never_runs_twice_concurrently() {
        let (store, iid) = store_with_instance().await;
        let gateway = ScriptedGateway::with_delay(
            vec![vec![user("u1")], vec![user("u1")]],
            Duration::from_millis(200),
        );
        let engine = engine(store, gateway);

        let slow = {
            let engine = engine.clone();
            let iid = iid.clone();
            tokio::spawn(async move {
                engine
                    .run_inline(
                        iid,
                        SyncType::Users,
                        TriggeredBy::Scheduled,
                        CancellationToken::new(),
                    )
                    .await
            })
        };
        // Let the first run claim the key.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = engine
            .run_inline(
                iid.clone(),
                SyncType::Users,
                TriggeredBy::Manual,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // A different sync type on the same instance is not blocked by the
        // users key (it fails later only because the script is empty).
        let other = engine
            .run_inline(
                iid,
                SyncType::Safes,
                TriggeredBy::Manual,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(other.sync_type, SyncType::Safes);

        let first = slow.await.unwrap().unwrap();
        assert_eq!(first.status, SyncJobStatus::Completed);
    }

    #[tokio::test]
    async fn logon_failure_marks_job_failed_and_still_schedules_next_run() {
        let (store, iid) = store_with_instance().await;
        let gateway = ScriptedGateway::new(vec![]);
        *gateway.fail_logon.lock() = true;
        let engine = engine(store.clone(), gateway);

        let job = engine
            .run_inline(
                iid.clone(),
                SyncType::Users,
                TriggeredBy::Scheduled,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(job.status, SyncJobStatus::Failed);
        assert!(job.error_message.unwrap().contains("logon refused"));

        let config = store.get_sync_config(iid, SyncType::Users).await.unwrap();
        assert_eq!(config.last_run_status, Some(SyncJobStatus::Failed));
        assert!(
            config.next_run_at.is_some(),
            "a failed run still schedules the next attempt"
        );
    }

    #[tokio::test]
    async fn trigger_returns_the_pending_job_and_runs_in_background() {
        let (store, iid) = store_with_instance().await;
        let gateway = ScriptedGateway::new(vec![vec![user("u1")]]);
        let engine = engine(store.clone(), gateway);

        let job = engine
            .trigger(
                iid.clone(),
                SyncType::Users,
                TriggeredBy::Manual,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(job.triggered_by, TriggeredBy::Manual);

        // Wait for the background run to finish.
        let mut finished = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = store.get_sync_job(job.id.clone()).await.unwrap();
            if current.status.is_terminal() {
                finished = Some(current);
                break;
            }
        }
        let finished = finished.expect("background sync finished");
        assert_eq!(finished.status, SyncJobStatus::Completed);
        assert_eq!(finished.records_synced, 1);
    }

    #[tokio::test]
    async fn cancellation_ends_the_run_as_cancelled() {
        let (store, iid) = store_with_instance().await;
        let gateway = ScriptedGateway::with_delay(
            vec![vec![user("u1"), user("u2"), user("u3")]],
            Duration::from_millis(100),
        );
        // Page size 1 so cancellation lands between pages.
        store
            .update_sync_config(
                iid.clone(),
                SyncType::Users,
                vp_domain::sync::SyncConfigPatch {
                    page_size: Some(1),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        let engine = engine(store, gateway);

        let cancel = CancellationToken::new();
        let cancel_after = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel_after.cancel();
        });

        let job = engine
            .run_inline(iid, SyncType::Users, TriggeredBy::Manual, cancel)
            .await
            .unwrap();
        assert_eq!(job.status, SyncJobStatus::Cancelled);
    }
}
