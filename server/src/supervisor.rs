//! Process lifecycle.
//!
//! 1. **Startup**: connect Postgres and Redis, run migrations, register projections
//! 2. **Runtime**: background tasks plus the HTTP server
//! 3. **Shutdown**: on Ctrl+C or SIGTERM the server stops accepting connections, the
//!    shutdown channel flips, and every task gets until the grace period ends to return

use crate::config::Config;
use anyhow::Context;
use sparkle_cqrs_core::event_bus::EventBus;
use sparkle_cqrs_core::lookup::CanonicalLookup;
use sparkle_cqrs_core::read_model::ReadModelStore;
use sparkle_cqrs_core::routing::{
    GROUP_COMMUNITY, GROUP_GALAXY, GROUP_TASK, STREAM_COMMUNITY, STREAM_GALAXY, STREAM_TASK,
};
use sparkle_cqrs_postgres::{
    OutboxRepository, PostgresCanonicalLookup, PostgresProjectionMetadata,
    ProcessedEventRepository,
};
use sparkle_cqrs_projections::community::COMMUNITY_PROJECTION;
use sparkle_cqrs_projections::galaxy::GALAXY_PROJECTION;
use sparkle_cqrs_projections::task::TASK_PROJECTION;
use sparkle_cqrs_projections::{
    CommunityProjection, GalaxyProjection, ProjectionConsumer, ProjectionManager, TaskProjection,
};
use sparkle_cqrs_redis::{RedisReadModelStore, RedisStreamBus};
use sparkle_cqrs_runtime::{
    BaseWorker, DlqCleaner, DlqHandler, HealthChecker, LedgerPruner, OutboxCleaner,
    PendingMonitor, PrometheusMetrics, Publisher, shutdown,
};
use sparkle_cqrs_web::{AppState, router};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Stream, consumer group and projection of every projection worker.
const PROJECTION_WORKERS: [(&str, &str, &str); 3] = [
    (STREAM_COMMUNITY, GROUP_COMMUNITY, COMMUNITY_PROJECTION),
    (STREAM_TASK, GROUP_TASK, TASK_PROJECTION),
    (STREAM_GALAXY, GROUP_GALAXY, GALAXY_PROJECTION),
];

const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// A named background task.
struct Task {
    name: String,
    handle: JoinHandle<()>,
}

fn spawn<F>(tasks: &mut Vec<Task>, name: impl Into<String>, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    tracing::info!(task = %name, "Starting background task");
    tasks.push(Task {
        name,
        handle: tokio::spawn(future),
    });
}

/// Run the pipeline until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if a dependency is unreachable at startup, migrations fail, a
/// projection cannot be registered or the HTTP listener cannot bind.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut metrics = PrometheusMetrics::new();
    metrics.install().context("installing Prometheus recorder")?;

    let pool = connect_postgres(&config).await?;
    sparkle_cqrs_postgres::migrate(&pool)
        .await
        .context("running migrations")?;
    tracing::info!("Migrations applied");

    let (client, conn) = sparkle_cqrs_redis::connect(&config.redis.url)
        .await
        .context("connecting to Redis")?;
    let bus: Arc<dyn EventBus> = Arc::new(RedisStreamBus::new(client, conn.clone()));
    let read_models: Arc<dyn ReadModelStore> = Arc::new(RedisReadModelStore::new(conn));

    let projections = register_projections(&pool, read_models).await?;
    let outbox = OutboxRepository::new(pool.clone());
    let dlq = Arc::new(DlqHandler::new(bus.clone(), config.dlq()));

    let (stop, shutdown_rx) = shutdown::channel();
    let mut tasks = Vec::new();

    let publisher = Publisher::new(outbox.clone(), bus.clone(), config.publisher());
    let rx = shutdown_rx.clone();
    spawn(&mut tasks, "publisher", async move { publisher.run(rx).await });

    let cleaner = OutboxCleaner::new(outbox.clone(), config.outbox_cleaner());
    let rx = shutdown_rx.clone();
    spawn(&mut tasks, "outbox_cleaner", async move { cleaner.run(rx).await });

    let monitor = PendingMonitor::new(Arc::new(outbox.clone()), config.pending_monitor());
    let rx = shutdown_rx.clone();
    spawn(&mut tasks, "pending_monitor", async move { monitor.run(rx).await });

    let dlq_cleaner = DlqCleaner::new(dlq.clone(), config.dlq_cleanup_interval());
    let rx = shutdown_rx.clone();
    spawn(&mut tasks, "dlq_cleaner", async move { dlq_cleaner.run(rx).await });

    let ledger = Arc::new(ProcessedEventRepository::new(pool.clone()));
    let pruner = LedgerPruner::new(
        ledger.clone(),
        config.processed_events_retention_days,
        LEDGER_PRUNE_INTERVAL,
    );
    let rx = shutdown_rx.clone();
    spawn(&mut tasks, "ledger_pruner", async move { pruner.run(rx).await });

    for (stream, group, projection) in PROJECTION_WORKERS {
        let consumer = ProjectionConsumer::for_registered(projections.clone(), projection)
            .await
            .with_context(|| format!("wiring worker for {projection}"))?;
        let worker = BaseWorker::new(bus.clone(), Arc::new(consumer), config.worker(stream, group))
            .with_ledger(ledger.clone())
            .with_dlq(dlq.clone());
        let rx = shutdown_rx.clone();
        spawn(&mut tasks, format!("worker:{group}"), async move {
            worker.run_supervised(rx).await;
        });
    }

    let health = HealthChecker::new(bus.clone(), config.health()).with_outbox(Arc::new(outbox));
    let app = router(AppState::new(
        Arc::new(health),
        Arc::new(metrics),
        projections,
    ));

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!(address = %address, "HTTP server listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await;
    if let Err(e) = &serve_result {
        tracing::error!(error = %e, "HTTP server failed");
    }

    tracing::info!("HTTP server stopped, initiating graceful shutdown");
    if stop.send(true).is_err() {
        tracing::debug!("Every background task already stopped");
    }
    await_shutdown(tasks, config.shutdown_timeout()).await;
    pool.close().await;

    tracing::info!("Graceful shutdown complete");
    serve_result.context("serving HTTP")
}

async fn connect_postgres(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .connect(&config.database.url)
        .await
        .context("connecting to Postgres")?;
    tracing::info!(
        max_connections = config.database.max_connections,
        "Connected to Postgres"
    );
    Ok(pool)
}

async fn register_projections(
    pool: &PgPool,
    read_models: Arc<dyn ReadModelStore>,
) -> anyhow::Result<Arc<ProjectionManager>> {
    let lookup: Arc<dyn CanonicalLookup> = Arc::new(PostgresCanonicalLookup::new(pool.clone()));
    let manager = Arc::new(ProjectionManager::new(Arc::new(
        PostgresProjectionMetadata::new(pool.clone()),
    )));

    manager
        .register(Arc::new(CommunityProjection::new(
            read_models.clone(),
            Some(lookup.clone()),
        )))
        .await?;
    manager
        .register(Arc::new(TaskProjection::new(read_models.clone(), Some(lookup))))
        .await?;
    manager
        .register(Arc::new(GalaxyProjection::new(read_models)))
        .await?;

    Ok(manager)
}

/// Wait for the tasks to return, sharing one deadline.
async fn await_shutdown(tasks: Vec<Task>, timeout: Duration) {
    let deadline = Instant::now() + timeout;

    for Task { name, handle } in tasks {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => tracing::info!(task = %name, "Task stopped gracefully"),
            Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "Task failed"),
            Err(_) => tracing::warn!(task = %name, "Task shutdown timed out"),
        }
    }
}

/// Resolves on Ctrl+C, SIGTERM, or when something else flips the shutdown channel.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
        () = shutdown::cancelled(&mut shutdown_rx) => {}
    }
}
