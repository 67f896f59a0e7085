//! Event log publisher.
//!
//! Drains pending outbox records to the bus, oldest commit first. Each record
//! is marked dispatched right after its own publish succeeds, so an aborted
//! run leaves exactly the unsent remainder pending. Runs never overlap, within
//! the process or across processes sharing the outbox: a run holds the
//! outbox's publisher lease and waits for it up to the configured lock
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use payflow_core::bus::MessageBus;
use payflow_core::error::DomainError;
use payflow_core::storage::{OutboxStorage, PublisherLease};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const LEASE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Pending records loaded per round trip.
    pub batch_size: usize,
    /// How long a run waits for a previous run to finish.
    pub lock_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lock_timeout: Duration::from_secs(300),
        }
    }
}

/// What one run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Records published and marked dispatched.
    pub dispatched: usize,
    /// Non-empty batches loaded.
    pub batches: usize,
}

/// Publishes committed events from the outbox.
pub struct EventLogPublisher {
    outbox: Arc<dyn OutboxStorage>,
    bus: Arc<dyn MessageBus>,
    running: Mutex<()>,
    config: PublisherConfig,
}

impl EventLogPublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(
        outbox: Arc<dyn OutboxStorage>,
        bus: Arc<dyn MessageBus>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            outbox,
            bus,
            running: Mutex::new(()),
            config,
        }
    }

    /// Publish pending records until none remain.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if another run holds the lock
    /// past the timeout, or the first storage or bus error, which aborts the
    /// run.
    pub async fn run(&self) -> Result<PublishReport, DomainError> {
        let deadline = Instant::now() + self.config.lock_timeout;
        let _running = tokio::time::timeout_at(deadline, self.running.lock())
            .await
            .map_err(|_| lock_timed_out())?;
        let mut lease = self.acquire_lease(deadline).await?;

        let drained = self.drain().await;
        if let Err(e) = lease.release().await {
            tracing::warn!(error = %e, "outbox publisher lease release failed");
        }
        drained
    }

    async fn acquire_lease(
        &self,
        deadline: Instant,
    ) -> Result<Box<dyn PublisherLease>, DomainError> {
        loop {
            if let Some(lease) = self.outbox.try_acquire_publisher_lease().await? {
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(lock_timed_out());
            }
            tokio::time::sleep((deadline - now).min(LEASE_RETRY_INTERVAL)).await;
        }
    }

    async fn drain(&self) -> Result<PublishReport, DomainError> {
        let batch_size = self.config.batch_size.max(1);
        let mut report = PublishReport::default();
        loop {
            let batch = self.outbox.get_pending(batch_size).await?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;

            for event in batch {
                let event_key = event.metadata.event_key;
                if let Err(e) = self.bus.raise_event(event.to_message()).await {
                    tracing::error!(
                        %event_key,
                        event_type = %event.event_type,
                        dispatched = report.dispatched,
                        error = %e,
                        "publish failed; aborting run"
                    );
                    return Err(e);
                }
                self.outbox.mark_dispatched(event_key).await?;
                tracing::debug!(%event_key, event_type = %event.event_type, "dispatched");
                report.dispatched += 1;
            }
        }

        if report.dispatched > 0 {
            tracing::info!(
                dispatched = report.dispatched,
                batches = report.batches,
                "outbox drained"
            );
        }
        Ok(report)
    }

    /// Re-run every `interval` until `shutdown` flips to `true` or its sender
    /// is dropped. Failed runs are retried on the next tick.
    #[must_use]
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(e) = self.run().await {
                    tracing::warn!(error = %e, "outbox publisher run failed");
                }
            }
            tracing::info!("outbox publisher stopped");
        })
    }
}

fn lock_timed_out() -> DomainError {
    DomainError::Infrastructure("outbox publisher is already running; lock wait timed out".into())
}
