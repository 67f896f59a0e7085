//! Shared wiring for Payments integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use payflow_core::aggregate::ApplyRegistry;
use payflow_core::bus::MessageBus;
use payflow_core::clock::Clock;
use payflow_core::storage::{EventStorageProvider, OutboxStorage, SnapshotStorageProvider};
use payflow_payments::application::event_handlers::ClientApplicationDirectory;
use payflow_payments::application::register_handlers;
use payflow_payments::domain::aggregates::{Charge, ClientApplication};
use payflow_payments::domain::commands::{CreateCharge, CreateClientApplication};
use payflow_runtime::dispatcher::MessageDispatcher;
use payflow_runtime::in_process_bus::InProcessBus;
use payflow_runtime::publisher::{EventLogPublisher, PublisherConfig};
use payflow_runtime::repository::{AggregateRepository, RepositoryConfig};
use payflow_runtime::scheduler::{
    CommandJobExecutor, CommandScheduler, JobRunner, JobRunnerConfig, TokioJobRunner,
};
use payflow_test_support::{FixedClock, InMemoryEventStore, InMemorySnapshotStore};
use uuid::Uuid;

/// Application key used by every command in these tests.
pub const APPLICATION_KEY: Uuid = Uuid::from_u128(0xA99);

/// Fixed timestamp used across the integration tests.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
}

/// Everything a test needs to drive the Payments context end to end.
pub struct Stack {
    pub dispatcher: Arc<MessageDispatcher>,
    pub bus: Arc<InProcessBus>,
    pub applications: Arc<AggregateRepository<ClientApplication>>,
    pub charges: Arc<AggregateRepository<Charge>>,
    pub directory: Arc<ClientApplicationDirectory>,
    pub runner: Arc<TokioJobRunner>,
    pub publisher: EventLogPublisher,
}

/// Wire the Payments context over the given storage. Committed events are
/// delivered only by the outbox publisher.
pub fn build_stack(
    events: Arc<dyn EventStorageProvider>,
    outbox: Arc<dyn OutboxStorage>,
    snapshots: Arc<dyn SnapshotStorageProvider>,
) -> Stack {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock(fixed_now()));
    let dispatcher = Arc::new(MessageDispatcher::default());
    let bus = Arc::new(InProcessBus::new(Arc::clone(&dispatcher), Arc::clone(&clock)));
    let config = RepositoryConfig {
        snapshot_frequency: 10,
        publish_on_commit: false,
    };

    let applications = Arc::new(
        AggregateRepository::new(
            ApplyRegistry::build().unwrap(),
            Arc::clone(&events),
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Arc::clone(&clock),
        )
        .with_snapshots(snapshots)
        .with_config(config.clone()),
    );
    let charges = Arc::new(
        AggregateRepository::new(
            ApplyRegistry::build().unwrap(),
            events,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Arc::clone(&clock),
        )
        .with_config(config),
    );

    let executor = Arc::new(CommandJobExecutor::new(Arc::clone(&bus) as Arc<dyn MessageBus>));
    let runner = Arc::new(TokioJobRunner::new(
        executor,
        Arc::clone(&clock),
        JobRunnerConfig::default(),
    ));
    let scheduler = Arc::new(CommandScheduler::new(
        Arc::clone(&runner) as Arc<dyn JobRunner>,
        clock,
    ));

    let directory = register_handlers(
        &dispatcher,
        Arc::clone(&applications),
        Arc::clone(&charges),
        scheduler,
    )
    .unwrap();
    let publisher = EventLogPublisher::new(
        outbox,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        PublisherConfig::default(),
    );

    Stack {
        dispatcher,
        bus,
        applications,
        charges,
        directory,
        runner,
        publisher,
    }
}

/// In-memory stack plus the stores behind it.
pub fn in_memory_stack() -> (Stack, Arc<InMemoryEventStore>, Arc<InMemorySnapshotStore>) {
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let stack = build_stack(
        Arc::clone(&store) as Arc<dyn EventStorageProvider>,
        Arc::clone(&store) as Arc<dyn OutboxStorage>,
        Arc::clone(&snapshots) as Arc<dyn SnapshotStorageProvider>,
    );
    (stack, store, snapshots)
}

pub fn create_application(correlation_key: Uuid, name: &str) -> CreateClientApplication {
    CreateClientApplication {
        correlation_key,
        application_key: APPLICATION_KEY,
        name: name.to_owned(),
        contact_email: "ops@storefront.example".to_owned(),
    }
}

pub fn create_charge(
    client_application_key: Uuid,
    amount_minor: i64,
    auto_capture_after_secs: Option<u32>,
) -> CreateCharge {
    CreateCharge {
        correlation_key: Uuid::new_v4(),
        application_key: APPLICATION_KEY,
        client_application_key,
        amount_minor,
        currency: "USD".to_owned(),
        auto_capture_after_secs,
    }
}
