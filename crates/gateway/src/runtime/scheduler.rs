//! Sync scheduler: a periodic tick that finds due (instance, sync_type)
//! configs and hands each to the sync engine. The engine's single-flight
//! guard and worker pool bound what actually runs.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vp_domain::sync::TriggeredBy;
use vp_domain::Error;
use vp_store::Store;

use super::sync_engine::SyncEngine;

pub struct SyncScheduler {
    store: Store,
    engine: SyncEngine,
    tick_interval: Duration,
}

impl SyncScheduler {
    pub fn new(store: Store, engine: SyncEngine, tick_interval: Duration) -> Self {
        Self {
            store,
            engine,
            tick_interval,
        }
    }

    /// Tick until shutdown. Each tick evaluates due configs once.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            tick_seconds = self.tick_interval.as_secs(),
            "sync scheduler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
            self.tick(&shutdown).await;
        }
        tracing::info!("sync scheduler stopped");
    }

    /// One evaluation pass: enqueue a run for every due key that is not
    /// already in flight.
    pub async fn tick(&self, shutdown: &CancellationToken) {
        let due = match self.store.list_due_sync_configs().await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "listing due sync configs failed");
                return;
            }
        };

        for (config, instance) in due {
            match self
                .engine
                .trigger(
                    instance.id.clone(),
                    config.sync_type,
                    TriggeredBy::Scheduled,
                    shutdown.child_token(),
                )
                .await
            {
                Ok(job) => tracing::info!(
                    sync_job_id = %job.id,
                    instance_id = %instance.id,
                    sync_type = config.sync_type.as_str(),
                    "scheduled sync run"
                ),
                // A run for this key is still going; the config will come
                // up again on a later tick.
                Err(Error::Conflict(_)) => tracing::debug!(
                    instance_id = %instance.id,
                    sync_type = config.sync_type.as_str(),
                    "sync already in flight, skipping"
                ),
                Err(e) => tracing::warn!(
                    instance_id = %instance.id,
                    sync_type = config.sync_type.as_str(),
                    error = %e,
                    "triggering scheduled sync failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::EventBus;
    use crate::runtime::sync_engine::tests::{store_with_instance, user, ScriptedGateway};
    use vp_domain::page::{PageRequest, SyncJobFilter};
    use vp_domain::sync::{SyncJobStatus, SyncType};

    #[tokio::test]
    async fn tick_triggers_all_due_keys() {
        let (store, iid) = store_with_instance().await;
        // Three due configs (users, safes, groups); scripts for each run.
        let gateway = ScriptedGateway::new(vec![
            vec![user("u1")],
            vec![user("u2")],
            vec![user("u3")],
        ]);
        let engine = SyncEngine::new(
            store.clone(),
            gateway,
            EventBus::new("sync-test"),
            4,
        );
        let scheduler = SyncScheduler::new(store.clone(), engine, Duration::from_secs(30));

        let shutdown = CancellationToken::new();
        scheduler.tick(&shutdown).await;

        // Wait for the background runs to settle.
        let mut terminal = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let jobs = store
                .list_sync_jobs(
                    SyncJobFilter {
                        cyberark_instance_id: Some(iid.clone()),
                        ..Default::default()
                    },
                    PageRequest::default(),
                )
                .await
                .unwrap();
            terminal = jobs
                .items
                .iter()
                .filter(|j| j.status.is_terminal())
                .count();
            if jobs.total == 3 && terminal == 3 {
                break;
            }
        }
        assert_eq!(terminal, 3, "all three due keys produced terminal runs");

        // Nothing is due right after a completed pass.
        let due = store.list_due_sync_configs().await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn tick_skips_keys_that_are_already_running() {
        let (store, iid) = store_with_instance().await;
        let gateway = ScriptedGateway::with_delay(
            vec![vec![user("u1")], vec![user("u1")], vec![user("u1")]],
            Duration::from_millis(300),
        );
        let engine = SyncEngine::new(
            store.clone(),
            gateway,
            EventBus::new("sync-test"),
            4,
        );
        // Only users is enabled, to keep one key in play.
        for sync_type in [SyncType::Safes, SyncType::Groups] {
            store
                .update_sync_config(
                    iid.clone(),
                    sync_type,
                    vp_domain::sync::SyncConfigPatch {
                        enabled: Some(false),
                        ..Default::default()
                    },
                    None,
                )
                .await
                .unwrap();
        }
        let scheduler = SyncScheduler::new(store.clone(), engine, Duration::from_secs(30));
        let shutdown = CancellationToken::new();

        scheduler.tick(&shutdown).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second tick while the first run is still sleeping inside the
        // scripted inventory: no second job may appear.
        scheduler.tick(&shutdown).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let jobs = store
            .list_sync_jobs(
                SyncJobFilter {
                    cyberark_instance_id: Some(iid.clone()),
                    sync_type: Some(SyncType::Users),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(jobs.total, 1, "at most one job per key in flight");

        // Let it finish so the test tears down cleanly.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let job = store.get_sync_job(jobs.items[0].id.clone()).await.unwrap();
            if job.status == SyncJobStatus::Completed {
                break;
            }
        }
    }
}
