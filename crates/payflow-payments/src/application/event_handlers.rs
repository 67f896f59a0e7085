//! Event subscribers of the Payments context.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use payflow_core::bus::EventHandler;
use payflow_core::error::DomainError;
use payflow_core::event::EventMetadata;
use payflow_core::message::EventEnvelope;
use payflow_runtime::scheduler::CommandScheduler;
use uuid::Uuid;

use crate::domain::commands::CaptureCharge;
use crate::domain::events::{
    ChargeCreated, ClientApplicationCreated, ClientApplicationDeactivated,
    ClientApplicationRenamed,
};

/// One row of the client application directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientApplicationSummary {
    /// Key of the client application.
    pub client_application_key: Uuid,
    /// Display name.
    pub name: String,
    /// Contact address.
    pub contact_email: String,
    /// Whether the application may still create charges.
    pub active: bool,
    /// Aggregate version reflected by this row.
    pub version: i16,
}

/// Read model listing client applications.
///
/// Events below a row's version are ignored, so redelivery from the outbox
/// is harmless. An event past the row's version is rejected until the events
/// before it have been projected.
#[derive(Debug, Default)]
pub struct ClientApplicationDirectory {
    rows: RwLock<HashMap<Uuid, ClientApplicationSummary>>,
}

impl ClientApplicationDirectory {
    /// An empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The row for `client_application_key`, if projected.
    #[must_use]
    pub fn get(&self, client_application_key: Uuid) -> Option<ClientApplicationSummary> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client_application_key)
            .cloned()
    }

    /// Active applications ordered by name.
    #[must_use]
    pub fn active(&self) -> Vec<ClientApplicationSummary> {
        let mut active: Vec<_> = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.name.cmp(&b.name));
        active
    }

    /// Number of projected applications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been projected yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(
        &self,
        metadata: &EventMetadata,
        change: impl FnOnce(&mut ClientApplicationSummary),
    ) -> Result<(), DomainError> {
        let mut rows = self
            .rows
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(row) = rows.get_mut(&metadata.aggregate_key) else {
            // Arrived before the creation event; failing makes the transport redeliver.
            return Err(DomainError::AggregateNotFound(metadata.aggregate_key));
        };
        if metadata.target_version < row.version {
            tracing::debug!(
                event_key = %metadata.event_key,
                version = row.version,
                "already projected"
            );
            return Ok(());
        }
        if metadata.target_version > row.version {
            // An earlier event is still missing; failing makes the transport redeliver.
            return Err(DomainError::AggregateStateMismatch {
                aggregate_key: Some(row.client_application_key),
                event_aggregate_key: metadata.aggregate_key,
                current_version: row.version,
                target_version: metadata.target_version,
            });
        }
        change(row);
        row.version = metadata.target_version + 1;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ClientApplicationCreated> for ClientApplicationDirectory {
    async fn handle(
        &self,
        event: EventEnvelope<ClientApplicationCreated>,
    ) -> Result<(), DomainError> {
        let mut rows = self
            .rows
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        rows.entry(event.metadata.aggregate_key)
            .or_insert_with(|| ClientApplicationSummary {
                client_application_key: event.metadata.aggregate_key,
                name: event.body.name,
                contact_email: event.body.contact_email,
                active: true,
                version: event.metadata.target_version + 1,
            });
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ClientApplicationRenamed> for ClientApplicationDirectory {
    async fn handle(
        &self,
        event: EventEnvelope<ClientApplicationRenamed>,
    ) -> Result<(), DomainError> {
        let name = event.body.name;
        self.apply(&event.metadata, |row| row.name = name)
    }
}

#[async_trait]
impl EventHandler<ClientApplicationDeactivated> for ClientApplicationDirectory {
    async fn handle(
        &self,
        event: EventEnvelope<ClientApplicationDeactivated>,
    ) -> Result<(), DomainError> {
        self.apply(&event.metadata, |row| row.active = false)
    }
}

/// Schedules the automatic capture of charges created with a capture delay.
///
/// The scheduled command reuses the creation event's key as its correlation
/// key, so a redelivered `ChargeCreated` schedules a duplicate that the job
/// executor drops.
pub struct AutoCaptureProcess {
    scheduler: Arc<CommandScheduler>,
}

impl AutoCaptureProcess {
    /// Create the process.
    #[must_use]
    pub fn new(scheduler: Arc<CommandScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl EventHandler<ChargeCreated> for AutoCaptureProcess {
    async fn handle(&self, event: EventEnvelope<ChargeCreated>) -> Result<(), DomainError> {
        let Some(after_secs) = event.body.auto_capture_after_secs else {
            return Ok(());
        };
        let command = CaptureCharge {
            correlation_key: event.metadata.event_key,
            application_key: event.metadata.application_key,
            charge_key: event.metadata.aggregate_key,
            amount_minor: None,
            automatic: true,
        };
        let job_id = self
            .scheduler
            .run_delayed(Duration::from_secs(u64::from(after_secs)), &command)
            .await?;
        tracing::info!(
            %job_id,
            charge_key = %command.charge_key,
            after_secs,
            "auto-capture scheduled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use payflow_core::command::Command;
    use payflow_runtime::scheduler::{CommandJob, JobRunner};
    use payflow_test_support::FixedClock;
    use std::sync::Mutex;

    fn metadata(aggregate_key: Uuid, target_version: i16) -> EventMetadata {
        let mut metadata =
            EventMetadata::new(aggregate_key, Uuid::from_u128(0xA99), Uuid::new_v4());
        metadata.target_version = target_version;
        metadata
    }

    fn created(aggregate_key: Uuid) -> EventEnvelope<ClientApplicationCreated> {
        EventEnvelope {
            metadata: metadata(aggregate_key, -1),
            body: ClientApplicationCreated {
                name: "Storefront".to_owned(),
                contact_email: "ops@storefront.example".to_owned(),
            },
        }
    }

    fn renamed(
        aggregate_key: Uuid,
        target_version: i16,
        name: &str,
    ) -> EventEnvelope<ClientApplicationRenamed> {
        EventEnvelope {
            metadata: metadata(aggregate_key, target_version),
            body: ClientApplicationRenamed {
                name: name.to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn test_directory_projects_lifecycle() {
        // Arrange
        let directory = ClientApplicationDirectory::new();
        let key = Uuid::new_v4();

        // Act
        directory.handle(created(key)).await.unwrap();
        directory.handle(renamed(key, 0, "Checkout")).await.unwrap();
        directory
            .handle(EventEnvelope {
                metadata: metadata(key, 1),
                body: ClientApplicationDeactivated {
                    reason: "closed".to_owned(),
                },
            })
            .await
            .unwrap();

        // Assert
        let row = directory.get(key).unwrap();
        assert_eq!(row.name, "Checkout");
        assert!(!row.active);
        assert_eq!(row.version, 2);
        assert!(directory.active().is_empty());
    }

    #[tokio::test]
    async fn test_directory_ignores_redelivered_events() {
        let directory = ClientApplicationDirectory::new();
        let key = Uuid::new_v4();
        directory.handle(created(key)).await.unwrap();
        directory.handle(renamed(key, 0, "Checkout")).await.unwrap();
        directory.handle(renamed(key, 1, "Billing")).await.unwrap();

        directory.handle(renamed(key, 0, "Checkout")).await.unwrap();
        directory.handle(created(key)).await.unwrap();

        let row = directory.get(key).unwrap();
        assert_eq!(row.name, "Billing");
        assert_eq!(row.version, 2);
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_directory_holds_back_events_that_skip_a_version() {
        // Arrange
        let directory = ClientApplicationDirectory::new();
        let key = Uuid::new_v4();
        directory.handle(created(key)).await.unwrap();
        let deactivated = EventEnvelope {
            metadata: metadata(key, 1),
            body: ClientApplicationDeactivated {
                reason: "closed".to_owned(),
            },
        };

        // Act
        let early = directory.handle(deactivated.clone()).await;
        directory.handle(renamed(key, 0, "Checkout")).await.unwrap();
        directory.handle(deactivated).await.unwrap();

        // Assert
        assert!(matches!(
            early,
            Err(DomainError::AggregateStateMismatch {
                current_version: 1,
                target_version: 1,
                ..
            })
        ));
        let row = directory.get(key).unwrap();
        assert_eq!(row.name, "Checkout");
        assert!(!row.active);
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_directory_rejects_update_before_creation() {
        let directory = ClientApplicationDirectory::new();
        let key = Uuid::new_v4();

        let result = directory.handle(renamed(key, 0, "Checkout")).await;

        assert!(matches!(result, Err(DomainError::AggregateNotFound(k)) if k == key));
        assert!(directory.is_empty());
    }

    #[derive(Default)]
    struct CapturingRunner {
        jobs: Mutex<Vec<CommandJob>>,
    }

    #[async_trait]
    impl JobRunner for CapturingRunner {
        async fn enqueue(&self, job: CommandJob) -> Result<(), DomainError> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    fn charge_created(auto_capture_after_secs: Option<u32>) -> EventEnvelope<ChargeCreated> {
        EventEnvelope {
            metadata: metadata(Uuid::new_v4(), -1),
            body: ChargeCreated {
                client_application_key: Uuid::new_v4(),
                amount_minor: 4_200,
                currency: "USD".to_owned(),
                auto_capture_after_secs,
            },
        }
    }

    #[tokio::test]
    async fn test_auto_capture_schedules_correlated_capture() {
        // Arrange
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let runner = Arc::new(CapturingRunner::default());
        let scheduler = Arc::new(CommandScheduler::new(
            Arc::clone(&runner) as Arc<dyn JobRunner>,
            Arc::new(FixedClock(now)),
        ));
        let process = AutoCaptureProcess::new(scheduler);
        let event = charge_created(Some(90));
        let event_key = event.metadata.event_key;
        let charge_key = event.metadata.aggregate_key;

        // Act
        process.handle(event).await.unwrap();

        // Assert
        let jobs = runner.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_at, Some(now + chrono::Duration::seconds(90)));
        let command: CaptureCharge = jobs[0].command.decode().unwrap();
        assert_eq!(command.correlation_key(), event_key);
        assert_eq!(command.charge_key, charge_key);
        assert!(command.automatic);
        assert_eq!(command.amount_minor, None);
    }

    #[tokio::test]
    async fn test_charge_without_delay_schedules_nothing() {
        let runner = Arc::new(CapturingRunner::default());
        let scheduler = Arc::new(CommandScheduler::new(
            Arc::clone(&runner) as Arc<dyn JobRunner>,
            Arc::new(FixedClock(Utc::now())),
        ));

        AutoCaptureProcess::new(scheduler)
            .handle(charge_created(None))
            .await
            .unwrap();

        assert!(runner.jobs.lock().unwrap().is_empty());
    }
}
