//! Payflow worker entry point.

use std::sync::Arc;

use payflow_core::aggregate::ApplyRegistry;
use payflow_core::bus::MessageBus;
use payflow_core::clock::{Clock, SystemClock};
use payflow_core::storage::{EventStorageProvider, OutboxStorage, SnapshotStorageProvider};
use payflow_event_store::schema::MIGRATOR;
use payflow_event_store::{PgEventStore, PgSnapshotStore};
use payflow_payments::application::register_handlers;
use payflow_runtime::dispatcher::MessageDispatcher;
use payflow_runtime::in_process_bus::InProcessBus;
use payflow_runtime::publisher::{EventLogPublisher, PublisherConfig};
use payflow_runtime::repository::{AggregateRepository, RepositoryConfig};
use payflow_runtime::scheduler::{
    CommandJobExecutor, CommandScheduler, JobRunner, JobRunnerConfig, TokioJobRunner,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod error;

use config::WorkerConfig;
use error::AppError;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Payflow worker");

    let config = WorkerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    MIGRATOR.run(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(PgEventStore::new(pool.clone()));
    let snapshots: Arc<dyn SnapshotStorageProvider> = Arc::new(PgSnapshotStore::new(pool.clone()));

    // Subscribers run before `raise_event` returns, so an outbox record is
    // marked dispatched only once every subscriber has succeeded.
    let dispatcher = Arc::new(MessageDispatcher::default());
    let bus: Arc<dyn MessageBus> =
        Arc::new(InProcessBus::new(Arc::clone(&dispatcher), Arc::clone(&clock)));

    let repository_config = RepositoryConfig {
        snapshot_frequency: config.snapshot_frequency,
        ..RepositoryConfig::default()
    };
    let applications = Arc::new(
        AggregateRepository::new(
            ApplyRegistry::build()?,
            Arc::clone(&store) as Arc<dyn EventStorageProvider>,
            Arc::clone(&bus),
            Arc::clone(&clock),
        )
        .with_snapshots(snapshots)
        .with_config(repository_config.clone()),
    );
    let charges = Arc::new(
        AggregateRepository::new(
            ApplyRegistry::build()?,
            Arc::clone(&store) as Arc<dyn EventStorageProvider>,
            Arc::clone(&bus),
            Arc::clone(&clock),
        )
        .with_config(repository_config),
    );

    let runner = Arc::new(TokioJobRunner::new(
        Arc::new(CommandJobExecutor::new(Arc::clone(&bus))),
        Arc::clone(&clock),
        JobRunnerConfig {
            workers: config.job_workers,
            ..JobRunnerConfig::default()
        },
    ));
    let scheduler = Arc::new(CommandScheduler::new(
        Arc::clone(&runner) as Arc<dyn JobRunner>,
        Arc::clone(&clock),
    ));
    register_handlers(&dispatcher, applications, charges, scheduler)?;

    let publisher = Arc::new(EventLogPublisher::new(
        store as Arc<dyn OutboxStorage>,
        bus,
        PublisherConfig {
            batch_size: config.outbox_batch_size,
            lock_timeout: config.outbox_lock_timeout,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher_task = publisher.spawn_periodic(config.outbox_poll_interval, shutdown_rx);
    tracing::info!(
        routes = dispatcher.routes().len(),
        poll_interval_ms =
            u64::try_from(config.outbox_poll_interval.as_millis()).unwrap_or(u64::MAX),
        "worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown_tx.send_replace(true);

    if let Err(e) = publisher_task.await {
        tracing::error!(error = %e, "outbox publisher task failed");
    }
    if tokio::time::timeout(config.shutdown_grace, runner.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            pending_jobs = runner.in_flight(),
            "shutdown grace period elapsed; abandoning pending jobs"
        );
    }
    pool.close().await;

    tracing::info!("Payflow worker stopped");
    Ok(())
}
