//! Aggregate repository.
//!
//! Loads aggregates by replaying their stream (shortcut by a snapshot when the
//! aggregate type supports it) and saves them under an optimistic version
//! check. Committed events are published on the bus right after the append;
//! the outbox publisher remains responsible for guaranteed delivery.

use std::sync::Arc;

use payflow_core::aggregate::{Aggregate, ApplyRegistry, NO_STREAM};
use payflow_core::bus::MessageBus;
use payflow_core::clock::Clock;
use payflow_core::error::DomainError;
use payflow_core::key::new_key;
use payflow_core::storage::{
    ALL_EVENTS, Commit, EventStorageProvider, Snapshot, SnapshotStorageProvider, StoredEvent,
    check_expected_version,
};
use uuid::Uuid;

/// Repository settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Snapshot cadence in versions; `0` disables snapshots.
    pub snapshot_frequency: i16,
    /// Publish committed events on the bus as part of `save`.
    pub publish_on_commit: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            snapshot_frequency: 10,
            publish_on_commit: true,
        }
    }
}

/// Snapshot cadence rule applied after a commit of `committed` events that
/// left the aggregate at `current_version`.
#[must_use]
pub fn should_snapshot(frequency: i16, current_version: i16, committed: usize) -> bool {
    if frequency <= 0 || current_version < frequency {
        return false;
    }
    let committed = i32::try_from(committed).unwrap_or(i32::MAX);
    let frequency = i32::from(frequency);
    let offset = i32::from(current_version) % frequency;
    committed >= frequency || offset < committed || offset == 0
}

/// Loads and saves aggregates of type `A`.
pub struct AggregateRepository<A: Aggregate> {
    registry: Arc<ApplyRegistry<A>>,
    events: Arc<dyn EventStorageProvider>,
    snapshots: Option<Arc<dyn SnapshotStorageProvider>>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    config: RepositoryConfig,
}

impl<A: Aggregate> AggregateRepository<A> {
    /// Create a repository without snapshot support.
    #[must_use]
    pub fn new(
        registry: Arc<ApplyRegistry<A>>,
        events: Arc<dyn EventStorageProvider>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            events,
            snapshots: None,
            bus,
            clock,
            config: RepositoryConfig::default(),
        }
    }

    /// Attach a snapshot provider.
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStorageProvider>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Override the default settings.
    #[must_use]
    pub fn with_config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// A blank aggregate sharing this repository's registry.
    #[must_use]
    pub fn create(&self) -> A {
        A::new(Arc::clone(&self.registry))
    }

    /// Load an aggregate by key; `None` if its stream does not exist.
    ///
    /// # Errors
    ///
    /// Propagates storage failures, payload decoding failures and apply
    /// errors raised while replaying.
    pub async fn get_by_id(&self, aggregate_key: Uuid) -> Result<Option<A>, DomainError> {
        let mut aggregate = self.create();
        let mut start_version = NO_STREAM;

        if let Some(snapshot) = self.load_snapshot(aggregate_key).await? {
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                %aggregate_key,
                version = snapshot.version,
                "restoring from snapshot"
            );
            aggregate.restore_state(snapshot.state)?;
            aggregate
                .stream_mut()
                .restore_from_snapshot(aggregate_key, snapshot.version)?;
            start_version = snapshot.version;
        }

        let stored = self
            .events
            .get_events(aggregate_key, start_version, ALL_EVENTS)
            .await?;
        if stored.is_empty() && aggregate.stream().is_new() {
            return Ok(None);
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            %aggregate_key,
            replayed = stored.len(),
            from_version = start_version,
            "replaying stream"
        );
        aggregate.load_from_history(decode_all::<A>(&stored)?)?;
        Ok(Some(aggregate))
    }

    /// Load the aggregate a command already produced, if any.
    ///
    /// # Errors
    ///
    /// See [`AggregateRepository::get_by_id`].
    pub async fn get_by_correlation(
        &self,
        correlation_key: Uuid,
        application_key: Uuid,
    ) -> Result<Option<A>, DomainError> {
        match self
            .original_aggregate(correlation_key, application_key)
            .await?
        {
            Some(aggregate_key) => self.get_by_id(aggregate_key).await,
            None => Ok(None),
        }
    }

    /// Fail with `DomainError::Duplicate` if a command with these keys was
    /// already processed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Duplicate` carrying the aggregate the command
    /// originally produced, or propagates storage failures.
    pub async fn ensure_not_duplicate(
        &self,
        correlation_key: Uuid,
        application_key: Uuid,
    ) -> Result<(), DomainError> {
        match self
            .original_aggregate(correlation_key, application_key)
            .await?
        {
            Some(original_aggregate_key) => Err(DomainError::Duplicate {
                original_aggregate_key,
                correlation_key,
                application_key,
            }),
            None => Ok(()),
        }
    }

    /// Persist the aggregate's uncommitted events.
    ///
    /// No-op if there is nothing to commit. Publish and snapshot failures
    /// after the append are logged, not returned: the events are durable and
    /// the outbox publisher will deliver them.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateCreation` or
    /// `DomainError::ConcurrencyConflict` if storage has moved since the
    /// aggregate was loaded, or propagates storage failures. Nothing is
    /// written in either case.
    pub async fn save(&self, aggregate: &mut A) -> Result<(), DomainError> {
        if !aggregate.stream().has_uncommitted() {
            return Ok(());
        }
        let aggregate_key = aggregate.aggregate_key().ok_or_else(|| {
            DomainError::Infrastructure(format!(
                "{} has uncommitted events but no key",
                A::AGGREGATE_TYPE
            ))
        })?;
        let expected_version = aggregate.stream().last_committed_version();

        let last = self.events.get_last_event(aggregate_key).await?;
        check_expected_version(
            aggregate_key,
            expected_version,
            last.map(|e| e.metadata.target_version),
        )?;

        let committed_at = self.clock.now();
        let mut pending = aggregate.stream().uncommitted_events();
        let mut stored = Vec::with_capacity(pending.len());
        for event in &mut pending {
            event.metadata.committed_at = Some(committed_at);
            stored.push(StoredEvent::from_event(A::AGGREGATE_TYPE, event)?);
        }
        let commit = Commit {
            aggregate_key,
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            expected_version,
            events: stored,
        };
        self.events.commit_changes(&commit).await?;
        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            %aggregate_key,
            version = aggregate.current_version(),
            events = commit.events.len(),
            "committed"
        );

        if self.config.publish_on_commit {
            self.publish(&commit).await;
        }
        self.maybe_snapshot(aggregate, aggregate_key, commit.events.len())
            .await;

        aggregate.stream_mut().mark_committed();
        Ok(())
    }

    async fn original_aggregate(
        &self,
        correlation_key: Uuid,
        application_key: Uuid,
    ) -> Result<Option<Uuid>, DomainError> {
        let events = self
            .events
            .get_events_by_correlation(correlation_key, application_key, NO_STREAM, 1)
            .await?;
        Ok(events.first().map(|e| e.metadata.aggregate_key))
    }

    async fn load_snapshot(&self, aggregate_key: Uuid) -> Result<Option<Snapshot>, DomainError> {
        if !A::SUPPORTS_SNAPSHOTS {
            return Ok(None);
        }
        match &self.snapshots {
            Some(store) => store.get_snapshot(A::AGGREGATE_TYPE, aggregate_key).await,
            None => Ok(None),
        }
    }

    async fn publish(&self, commit: &Commit) {
        for event in &commit.events {
            if let Err(e) = self.bus.raise_event(event.to_message()).await {
                tracing::warn!(
                    aggregate_key = %commit.aggregate_key,
                    event_key = %event.metadata.event_key,
                    event_type = %event.event_type,
                    error = %e,
                    "publish after commit failed; left to the outbox publisher"
                );
            }
        }
    }

    async fn maybe_snapshot(&self, aggregate: &A, aggregate_key: Uuid, committed: usize) {
        if !A::SUPPORTS_SNAPSHOTS {
            return;
        }
        let Some(store) = &self.snapshots else {
            return;
        };
        let version = aggregate.current_version();
        if !should_snapshot(self.config.snapshot_frequency, version, committed) {
            return;
        }

        let result = match aggregate.snapshot_state() {
            Ok(state) => {
                let snapshot = Snapshot {
                    snapshot_key: new_key(),
                    aggregate_key,
                    aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                    version,
                    state,
                    taken_at: self.clock.now(),
                };
                store.save_snapshot(&snapshot).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                %aggregate_key,
                version,
                "snapshot saved"
            ),
            Err(e) => tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                %aggregate_key,
                version,
                error = %e,
                "snapshot save failed"
            ),
        }
    }
}

fn decode_all<A: Aggregate>(
    stored: &[StoredEvent],
) -> Result<Vec<payflow_core::event::Event<A::Kind>>, DomainError> {
    stored.iter().map(StoredEvent::to_event::<A::Kind>).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use payflow_core::message::Message;
    use payflow_test_support::tally::{Tally, TallyAdded, new_tally, tally_registry};
    use payflow_test_support::{
        FailingBus, FixedClock, InMemoryEventStore, InMemorySnapshotStore, RecordingBus,
    };

    struct Fixture {
        store: Arc<InMemoryEventStore>,
        snapshots: Arc<InMemorySnapshotStore>,
        bus: Arc<RecordingBus>,
        repo: AggregateRepository<Tally>,
    }

    fn fixture(snapshot_frequency: i16) -> Fixture {
        let store = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let bus = Arc::new(RecordingBus::new());
        let clock = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let repo = AggregateRepository::new(
            tally_registry(),
            Arc::clone(&store) as Arc<dyn EventStorageProvider>,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            clock,
        )
        .with_snapshots(Arc::clone(&snapshots) as Arc<dyn SnapshotStorageProvider>)
        .with_config(RepositoryConfig {
            snapshot_frequency,
            publish_on_commit: true,
        });
        Fixture {
            store,
            snapshots,
            bus,
            repo,
        }
    }

    async fn saved_tally(fx: &Fixture, additions: usize) -> Uuid {
        let key = Uuid::new_v4();
        let mut tally = new_tally();
        tally.open(key, "groceries").unwrap();
        for _ in 0..additions {
            tally.add(1).unwrap();
        }
        fx.repo.save(&mut tally).await.unwrap();
        key
    }

    /// A repository over the same store that never snapshots.
    fn plain_repo(fx: &Fixture) -> AggregateRepository<Tally> {
        AggregateRepository::new(
            tally_registry(),
            Arc::clone(&fx.store) as Arc<dyn EventStorageProvider>,
            Arc::new(RecordingBus::new()),
            Arc::new(FixedClock(Utc::now())),
        )
    }

    async fn seeded_tally(fx: &Fixture, additions: usize) -> Uuid {
        let repo = plain_repo(fx);
        let key = Uuid::new_v4();
        let mut tally = new_tally();
        tally.open(key, "groceries").unwrap();
        for _ in 0..additions {
            tally.add(1).unwrap();
        }
        repo.save(&mut tally).await.unwrap();
        key
    }

    #[test]
    fn test_snapshot_cadence() {
        assert!(should_snapshot(5, 9, 5));
        assert!(!should_snapshot(5, 9, 3));
        assert!(should_snapshot(5, 10, 1));
        assert!(should_snapshot(5, 6, 2));
        assert!(!should_snapshot(5, 4, 5));
        assert!(!should_snapshot(0, 100, 100));
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips_state() {
        // Arrange
        let fx = fixture(0);
        let key = Uuid::new_v4();
        let mut tally = new_tally();
        tally.open(key, "rent").unwrap();
        tally.add(40).unwrap();
        tally.add(2).unwrap();

        // Act
        fx.repo.save(&mut tally).await.unwrap();
        let loaded = fx.repo.get_by_id(key).await.unwrap().unwrap();

        // Assert
        assert_eq!(tally.stream().uncommitted_count(), 0);
        assert_eq!(tally.stream().last_committed_version(), 2);
        assert_eq!(loaded.total(), 42);
        assert_eq!(loaded.label(), "rent");
        assert_eq!(loaded.current_version(), 2);
        assert_eq!(fx.store.pending_keys().len(), 3);
        assert_eq!(fx.bus.raised_events().len(), 3);
        let stamped = fx.store.all_events();
        assert!(stamped.iter().all(|e| e.metadata.committed_at.is_some()));
    }

    #[tokio::test]
    async fn test_missing_stream_loads_as_none() {
        let fx = fixture(0);

        assert!(fx.repo.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_without_changes_is_noop() {
        let fx = fixture(0);
        let key = saved_tally(&fx, 0).await;
        let mut tally = fx.repo.get_by_id(key).await.unwrap().unwrap();

        fx.repo.save(&mut tally).await.unwrap();

        assert_eq!(fx.store.all_events().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_copy_is_rejected_without_writing() {
        // Arrange: stream with last target version 4.
        let fx = fixture(0);
        let key = saved_tally(&fx, 0).await;
        let mut stale = fx.repo.get_by_id(key).await.unwrap().unwrap();
        let mut fresh = fx.repo.get_by_id(key).await.unwrap().unwrap();
        for _ in 0..5 {
            fresh.add(1).unwrap();
        }
        fx.repo.save(&mut fresh).await.unwrap();
        assert_eq!(fx.store.get_last_event(key).await.unwrap().unwrap().metadata.target_version, 4);

        // Act
        stale.add(10).unwrap();
        let result = fx.repo.save(&mut stale).await;

        // Assert
        match result {
            Err(DomainError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 5);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
        assert_eq!(fx.store.all_events().len(), 6);
        assert!(stale.stream().has_uncommitted());
    }

    #[tokio::test]
    async fn test_second_creation_of_same_stream_is_rejected() {
        let fx = fixture(0);
        let key = saved_tally(&fx, 0).await;
        let mut twin = new_tally();
        twin.open(key, "twin").unwrap();

        let result = fx.repo.save(&mut twin).await;

        assert!(matches!(
            result,
            Err(DomainError::AggregateCreation { aggregate_key }) if aggregate_key == key
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_save() {
        let store = Arc::new(InMemoryEventStore::new());
        let repo: AggregateRepository<Tally> = AggregateRepository::new(
            tally_registry(),
            Arc::clone(&store) as Arc<dyn EventStorageProvider>,
            Arc::new(FailingBus),
            Arc::new(FixedClock(Utc::now())),
        );
        let mut tally = new_tally();
        tally.open(Uuid::new_v4(), "x").unwrap();

        repo.save(&mut tally).await.unwrap();

        assert_eq!(store.pending_keys().len(), 1);
        assert!(!tally.stream().has_uncommitted());
    }

    #[tokio::test]
    async fn test_commit_of_five_events_at_version_nine_takes_snapshot() {
        // Arrange: five persisted events, version 4.
        let fx = fixture(5);
        let key = seeded_tally(&fx, 4).await;
        let mut tally = fx.repo.get_by_id(key).await.unwrap().unwrap();
        assert_eq!(tally.current_version(), 4);

        // Act
        for _ in 0..5 {
            tally.add(2).unwrap();
        }
        fx.repo.save(&mut tally).await.unwrap();

        // Assert
        let saved = fx.snapshots.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].version, 9);
        assert_eq!(saved[0].aggregate_type, Tally::AGGREGATE_TYPE);
    }

    #[tokio::test]
    async fn test_commit_of_three_events_at_version_nine_skips_snapshot() {
        let fx = fixture(5);
        let key = seeded_tally(&fx, 6).await;
        let mut tally = fx.repo.get_by_id(key).await.unwrap().unwrap();

        for _ in 0..3 {
            tally.add(1).unwrap();
        }
        fx.repo.save(&mut tally).await.unwrap();

        assert_eq!(tally.current_version(), 9);
        assert!(fx.snapshots.saved().is_empty());
    }

    #[tokio::test]
    async fn test_load_from_snapshot_replays_only_the_tail() {
        // Arrange: snapshot at version 9, then one more event.
        let fx = fixture(5);
        let key = seeded_tally(&fx, 4).await;
        let mut tally = fx.repo.get_by_id(key).await.unwrap().unwrap();
        for _ in 0..5 {
            tally.add(2).unwrap();
        }
        fx.repo.save(&mut tally).await.unwrap();
        let plain = plain_repo(&fx);
        let mut latest = plain.get_by_id(key).await.unwrap().unwrap();
        latest.add(100).unwrap();
        plain.save(&mut latest).await.unwrap();

        // Act
        let loaded = fx.repo.get_by_id(key).await.unwrap().unwrap();

        // Assert
        assert_eq!(fx.snapshots.saved().len(), 1);
        assert_eq!(loaded.current_version(), 10);
        assert_eq!(loaded.total(), 4 + 10 + 100);
    }

    #[tokio::test]
    async fn test_duplicate_detection_reports_original_aggregate() {
        // Arrange
        let fx = fixture(0);
        let key = Uuid::new_v4();
        let correlation_key = Uuid::new_v4();
        let mut tally = new_tally();
        tally.open_correlated(key, "first", correlation_key).unwrap();
        fx.repo.save(&mut tally).await.unwrap();

        // Act
        let result = fx
            .repo
            .ensure_not_duplicate(correlation_key, Tally::APPLICATION_KEY)
            .await;
        let existing = fx
            .repo
            .get_by_correlation(correlation_key, Tally::APPLICATION_KEY)
            .await
            .unwrap();

        // Assert
        assert_eq!(result.unwrap_err().original_aggregate_key(), Some(key));
        assert_eq!(existing.unwrap().aggregate_key(), Some(key));
        assert!(
            fx.repo
                .ensure_not_duplicate(Uuid::new_v4(), Tally::APPLICATION_KEY)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_published_messages_carry_event_type_and_metadata() {
        let fx = fixture(0);
        let key = saved_tally(&fx, 1).await;

        let raised = fx.bus.raised_events();

        assert_eq!(raised[1].message_type, TallyAdded::MESSAGE_TYPE);
        let metadata = raised[1].event.clone().unwrap();
        assert_eq!(metadata.aggregate_key, key);
        assert_eq!(metadata.target_version, 0);
    }
}
