use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vp_domain::config::{AppConfig, ConfigSeverity};
use vp_gateway::api;
use vp_gateway::bootstrap::{self, StoreCaSource};
use vp_gateway::cli::{Cli, Command, ConfigCommand};
use vp_gateway::runtime::{
    CancelMap, EventBus, Pipeline, SyncEngine, SyncScheduler, UpstreamVaultGateway,
};
use vp_gateway::state::AppState;
use vp_upstream::{ClientFactory, TrustStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let config = AppConfig::from_env().context("reading configuration")?;
            init_tracing(&config);
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = AppConfig::from_env().context("reading configuration")?;
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                println!("{tag}: {issue}");
            }
            if AppConfig::has_errors(&issues) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Version) => {
            println!("vaultpilot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured logging: compact in development, JSON in production.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.is_production() {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "VaultPilot starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if AppConfig::has_errors(&issues) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ────────────────────────────────────────────────────────
    let store = bootstrap::open_store(&config)
        .await
        .context("opening store")?;

    // ── Initial admin ────────────────────────────────────────────────
    bootstrap::seed_initial_admin(&store, &config)
        .await
        .context("seeding initial admin")?;

    // ── Trust store + client factory ─────────────────────────────────
    let trust = Arc::new(TrustStore::new(Arc::new(StoreCaSource::new(store.clone()))));
    match trust.refresh().await {
        Ok(count) => tracing::info!(ca_count = count, "trust store loaded"),
        Err(e) => tracing::warn!(error = %e, "initial trust refresh failed, continuing with built-in roots"),
    }
    let factory = Arc::new(ClientFactory::new(
        trust.clone(),
        config.pipeline.default_timeout,
    ));
    tracing::info!("upstream client factory ready");

    // ── Event buses + cancellation ───────────────────────────────────
    let operation_events = EventBus::new("operations");
    let sync_events = EventBus::new("sync-jobs");
    let cancel_map = Arc::new(CancelMap::new());
    let shutdown = CancellationToken::new();

    // ── Sync engine ──────────────────────────────────────────────────
    let sync_engine = SyncEngine::new(
        store.clone(),
        Arc::new(UpstreamVaultGateway::new(factory.clone(), store.clone())),
        sync_events.clone(),
        config.scheduler.parallelism,
    );
    tracing::info!(
        parallelism = config.scheduler.parallelism,
        "sync engine ready"
    );

    // ── Pipeline + handler registry ──────────────────────────────────
    let registry = Arc::new(vp_gateway::runtime::handlers::default_registry(Arc::new(
        sync_engine.clone(),
    )));
    tracing::info!(
        handlers = registry.registered_types().len(),
        "operation handlers registered"
    );
    let pipeline = Pipeline::new(
        store.clone(),
        factory.clone(),
        registry,
        operation_events.clone(),
        cancel_map.clone(),
        config.pipeline.clone(),
    );

    // ── Crash recovery ───────────────────────────────────────────────
    let recovered = pipeline.recover().await.context("recovering operations")?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "operations requeued after restart");
    }
    bootstrap::recover_interrupted_work(&store)
        .await
        .context("recovering sync jobs")?;

    // ── Pipeline worker ──────────────────────────────────────────────
    let pipeline_task = {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pipeline.run(shutdown).await })
    };

    // ── Scheduler ticker ─────────────────────────────────────────────
    let scheduler_task = {
        let scheduler = SyncScheduler::new(
            store.clone(),
            sync_engine.clone(),
            config.scheduler.tick_interval,
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    // ── Trust-store refresher ────────────────────────────────────────
    {
        let trust = trust.clone();
        let interval = config.trust_refresh_interval;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = trust.refresh().await {
                    tracing::warn!(error = %e, "scheduled trust refresh failed");
                }
            }
        });
    }

    // ── Session janitor (hourly) ─────────────────────────────────────
    {
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(3_600)) => {}
                }
                match store.purge_expired_sessions().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "expired sessions removed"),
                    Err(e) => tracing::warn!(error = %e, "session sweep failed"),
                }
            }
        });
    }

    // ── App state + router ───────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        store,
        trust,
        factory,
        operation_events,
        sync_events,
        cancel_map,
        sync_engine,
        shutdown: shutdown.clone(),
    };

    let max_concurrent = std::env::var("HTTP_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    let app = api::router(state.clone())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    // ── Bind + serve with graceful shutdown ──────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding to {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "VaultPilot listening");

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("http server error")?;

    // ── Drain background work within the grace period ────────────────
    let grace = config.pipeline.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        let _ = pipeline_task.await;
        let _ = scheduler_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            grace_seconds = grace.as_secs(),
            "background work did not drain within the grace period"
        );
    }
    tracing::info!("VaultPilot stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
