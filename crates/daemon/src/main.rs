//! GeoFlow Engine - Main Entry Point
//! Composition root: config, wiring, worker loops, graceful shutdown.

mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use geoflow_core::application::{
    CheckpointManager, CoreMachine, ExecutionEnv, HandlerRegistry, QueueKind, QueueWorker,
    QueueWorkerOptions, RouterConfig, ShortLivedWorker, ShutdownSignal, StoreProgressSink,
    TaskRouter, WorkflowRegistry,
};
use geoflow_core::port::{Maintenance, MaintenanceConfig, SystemTimeProvider, UuidProvider};
use geoflow_infra_sqlite::{
    create_pool, run_migrations, BrokerConfig, PoolHandle, QueueOptions, SqliteMaintenance,
    SqliteMessageBroker, SqliteStateStore,
};

use crate::config::{Settings, WorkerMode};
use geoflow_core::application::worker::constants::MAX_LOCK_RENEWAL_WINDOW;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for in-flight handlers to checkpoint and return after
/// a shutdown signal.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive wait per short-mode invocation.
const SHORT_INVOCATION_WAIT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging (JSON for production, pretty for development)
    let log_format = std::env::var("GEOFLOW_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("geoflow=info"))
        .expect("Failed to create env filter");

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    info!("GeoFlow engine v{} starting", VERSION);

    if let Err(e) = telemetry::init_telemetry() {
        warn!(error = ?e, "failed to initialize OpenTelemetry (continuing without it)");
    }

    // 2. Load configuration
    let settings = Settings::load().map_err(|e| anyhow::anyhow!("config: {e}"))?;
    let database_url = settings.database_url();
    info!(database_url = %database_url, mode = ?settings.worker.mode, "configuration loaded");

    // 3. Initialize database
    let pool = PoolHandle::new(
        create_pool(&database_url, settings.database.max_connections)
            .await
            .map_err(|e| anyhow::anyhow!("pool creation failed: {e}"))?,
    );
    run_migrations(&pool.current().await)
        .await
        .map_err(|e| anyhow::anyhow!("migration failed: {e}"))?;

    // 4. Wire dependencies
    let time_provider = Arc::new(SystemTimeProvider);
    let id_provider = Arc::new(UuidProvider);

    let store = Arc::new(SqliteStateStore::new(pool.clone(), time_provider.clone()));

    let broker_config = BrokerConfig::default()
        .with_queue(
            settings.queues.job.clone(),
            QueueOptions {
                lock_duration: Duration::from_secs(settings.queues.short_lock_seconds),
                max_delivery_count: settings.queues.short_max_delivery,
            },
        )
        .with_queue(
            settings.queues.task_short.clone(),
            QueueOptions {
                lock_duration: Duration::from_secs(settings.queues.short_lock_seconds),
                max_delivery_count: settings.queues.short_max_delivery,
            },
        )
        .with_queue(
            settings.queues.task_long.clone(),
            QueueOptions {
                lock_duration: Duration::from_secs(settings.queues.long_lock_seconds),
                max_delivery_count: settings.queues.long_max_delivery,
            },
        );
    let broker = Arc::new(SqliteMessageBroker::new(
        pool.clone(),
        time_provider.clone(),
        id_provider.clone(),
        broker_config,
    ));

    let mut workflow_registry = WorkflowRegistry::new();
    let mut handler_registry = HandlerRegistry::new();
    geoflow_core::application::builtin::register_builtin(&mut workflow_registry, &mut handler_registry);
    let workflow_registry = Arc::new(workflow_registry);
    let handler_registry = Arc::new(handler_registry);

    let router = TaskRouter::new(RouterConfig {
        default_queue: settings.queues.task_short.clone(),
        long_queue: settings.queues.task_long.clone(),
        queue_pins: settings.queues.specialized.clone(),
        long_queue_task_types: settings.router.long_queue_task_types.iter().cloned().collect(),
        size_threshold_bytes: settings.router.size_threshold_bytes,
    });

    let machine = Arc::new(CoreMachine::new(
        store.clone(),
        broker.clone(),
        workflow_registry.clone(),
        handler_registry.clone(),
        router,
        settings.queues.job.clone(),
        time_provider.clone(),
        id_provider.clone(),
    ));

    // 5. Worker environment + shutdown plumbing
    let shutdown = ShutdownSignal::new();
    let checkpoints = Arc::new(CheckpointManager::new(store.clone(), time_provider.clone()));

    // 6. Start workers: the job queue plus the task queues for this mode
    let mut worker_handles = Vec::new();
    match settings.worker.mode {
        WorkerMode::Long => {
            let env = ExecutionEnv::long(
                settings.worker.app_id.clone(),
                checkpoints,
                shutdown.clone(),
            )
            .with_progress(Arc::new(StoreProgressSink::new(
                store.clone(),
                time_provider.clone(),
            )));
            let subscriptions = vec![
                (settings.queues.job.clone(), QueueKind::Jobs, short_queue_options(&settings)),
                (
                    settings.queues.task_short.clone(),
                    QueueKind::Tasks,
                    short_queue_options(&settings),
                ),
                (
                    settings.queues.task_long.clone(),
                    QueueKind::Tasks,
                    long_queue_options(&settings),
                ),
            ];
            for (queue, kind, options) in subscriptions {
                let worker = QueueWorker::new(
                    queue.clone(),
                    kind,
                    broker.clone(),
                    machine.clone(),
                    env.clone(),
                    options,
                );
                let signal = shutdown.clone();
                worker_handles.push(tokio::spawn(async move {
                    if let Err(e) = worker.run(signal).await {
                        error!(queue = %queue, error = %e, "worker failed");
                    }
                }));
            }
        }
        WorkerMode::Short => {
            // Serverless emulation: one single-message invocation at a time,
            // no checkpointing, no lock renewal
            let subscriptions = vec![
                (settings.queues.job.clone(), QueueKind::Jobs),
                (settings.queues.task_short.clone(), QueueKind::Tasks),
            ];
            for (queue, kind) in subscriptions {
                let worker = ShortLivedWorker::new(
                    queue.clone(),
                    kind,
                    broker.clone(),
                    machine.clone(),
                    settings.worker.app_id.clone(),
                    settings.queues.short_max_delivery,
                );
                let signal = shutdown.clone();
                worker_handles.push(tokio::spawn(async move {
                    while !signal.is_set() {
                        match worker.run_once(SHORT_INVOCATION_WAIT).await {
                            Ok(_) => {}
                            Err(e) => {
                                error!(queue = %queue, error = %e, "invocation failed");
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                    _ = signal.wait() => break,
                                }
                            }
                        }
                    }
                }));
            }
        }
    }

    // 7. Credential-rotation pool rebuild loop
    if settings.worker.token_refresh_minutes > 0 {
        let pool = pool.clone();
        let url = database_url.clone();
        let max_connections = settings.database.max_connections;
        let interval = Duration::from_secs(settings.worker.token_refresh_minutes * 60);
        let signal = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = signal.wait() => break,
                }
                if let Err(e) = pool.rebuild(&url, max_connections).await {
                    error!(error = %e, "pool rebuild failed");
                }
            }
        });
    }

    // 8. Periodic maintenance: retention GC + vacuum on a fixed cadence,
    // reporting the backlog gauges an operator watches
    {
        let maintenance = SqliteMaintenance::new(pool.clone(), time_provider.clone());
        let maintenance_config = MaintenanceConfig {
            finished_job_retention_days: settings.maintenance.retention_days,
        };
        let interval = Duration::from_secs(settings.maintenance.interval_hours * 3600);
        let signal = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = signal.wait() => break,
                }
                match maintenance.run_full_maintenance(&maintenance_config).await {
                    Ok(stats) => info!(
                        db_size_bytes = stats.db_size_bytes,
                        jobs_in_flight = stats.jobs_in_flight,
                        tasks_processing = stats.tasks_processing,
                        tasks_checkpointed = stats.tasks_checkpointed,
                        queue_backlog = stats.queue_backlog,
                        dead_letters = stats.dead_letter_count,
                        "maintenance pass complete"
                    ),
                    Err(e) => error!(error = %e, "maintenance pass failed"),
                }
            }
        });
    }

    info!("engine ready, waiting for messages");

    // 9. Wait for SIGTERM/SIGINT
    wait_for_signal().await?;
    info!("shutdown signal received, draining workers");

    // 10. Graceful shutdown: workers stop taking messages; in-flight
    // handlers observe the signal, checkpoint, and return interrupted.
    shutdown.trigger();
    for handle in worker_handles {
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("worker did not drain within the shutdown timeout");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Job-queue and short task-queue consumption share the same profile.
fn short_queue_options(settings: &Settings) -> QueueWorkerOptions {
    QueueWorkerOptions {
        lock_duration: Duration::from_secs(settings.queues.short_lock_seconds),
        max_delivery_count: settings.queues.short_max_delivery,
        renew_locks: false,
        max_renewal_window: MAX_LOCK_RENEWAL_WINDOW,
    }
}

fn long_queue_options(settings: &Settings) -> QueueWorkerOptions {
    QueueWorkerOptions {
        lock_duration: Duration::from_secs(settings.queues.long_lock_seconds),
        max_delivery_count: settings.queues.long_max_delivery,
        renew_locks: true,
        max_renewal_window: MAX_LOCK_RENEWAL_WINDOW,
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
