//! Storage provider abstractions.
//!
//! The event store is an append-only log per aggregate stream that doubles
//! as a transactional outbox: every committed event is written as a pending
//! record and later flipped to dispatched by the outbox publisher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::NO_STREAM;
use crate::error::DomainError;
use crate::event::{Event, EventKind, EventMetadata};
use crate::message::RawMessage;

/// Read every remaining event in a range.
pub const ALL_EVENTS: usize = usize::MAX;

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxState {
    /// Committed but not yet published.
    Pending,
    /// Published to the bus at least once.
    Dispatched,
}

impl OutboxState {
    /// Persisted discriminant.
    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Pending => 0,
            Self::Dispatched => 1,
        }
    }

    /// Parses a persisted discriminant.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` for unknown values.
    pub fn from_i16(value: i16) -> Result<Self, DomainError> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Dispatched),
            other => Err(DomainError::Serialization(format!(
                "unknown outbox state {other}"
            ))),
        }
    }
}

/// Stored representation of a domain event (one outbox record).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Event metadata, including the commit timestamp.
    pub metadata: EventMetadata,
    /// Type of the aggregate that raised the event.
    pub aggregate_type: String,
    /// Event type discriminator.
    pub event_type: String,
    /// Serialized event payload.
    pub body: serde_json::Value,
    /// Number of times the publisher has sent this record.
    pub times_sent: i16,
    /// Delivery state.
    pub state: OutboxState,
}

impl StoredEvent {
    /// Converts a typed event into a pending outbox record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    pub fn from_event<K: EventKind>(
        aggregate_type: &str,
        event: &Event<K>,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            metadata: event.metadata.clone(),
            aggregate_type: aggregate_type.to_owned(),
            event_type: event.event_type().to_owned(),
            body: event.kind.to_body()?,
            times_sent: 0,
            state: OutboxState::Pending,
        })
    }

    /// Rehydrates the typed event named by the stored discriminator.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the discriminator is unknown
    /// to `K` or the payload does not match it.
    pub fn to_event<K: EventKind>(&self) -> Result<Event<K>, DomainError> {
        Ok(Event::new(
            self.metadata.clone(),
            K::from_body(&self.event_type, self.body.clone())?,
        ))
    }

    /// The bus message for this record.
    #[must_use]
    pub fn to_message(&self) -> RawMessage {
        RawMessage::event(
            self.event_type.clone(),
            self.metadata.clone(),
            self.body.clone(),
        )
    }

    /// Commit timestamp of the record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the event was never stamped.
    pub fn committed_at(&self) -> Result<DateTime<Utc>, DomainError> {
        self.metadata.committed_at.ok_or_else(|| {
            DomainError::Infrastructure(format!(
                "event {} has no commit timestamp",
                self.metadata.event_key
            ))
        })
    }
}

/// A batch of events appended atomically to one aggregate stream.
#[derive(Debug, Clone)]
pub struct Commit {
    /// The stream being extended.
    pub aggregate_key: Uuid,
    /// Type of the aggregate.
    pub aggregate_type: String,
    /// The aggregate's last committed version when the events were raised.
    pub expected_version: i16,
    /// Events in stream order.
    pub events: Vec<StoredEvent>,
}

/// Cached point-in-time aggregate state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Unique snapshot identifier.
    pub snapshot_key: Uuid,
    /// The aggregate the state belongs to.
    pub aggregate_key: Uuid,
    /// Type of the aggregate.
    pub aggregate_type: String,
    /// Aggregate version the state reflects.
    pub version: i16,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Checks that a stream may be extended from `expected_version`, given the
/// target version of the last persisted event.
///
/// # Errors
///
/// Returns `DomainError::AggregateCreation` if the caller expected to create
/// the stream but it exists, or `DomainError::ConcurrencyConflict` if the
/// stream has moved past `expected_version`.
pub fn check_expected_version(
    aggregate_key: Uuid,
    expected_version: i16,
    last_persisted_target: Option<i16>,
) -> Result<(), DomainError> {
    let Some(last_target) = last_persisted_target else {
        return Ok(());
    };
    if expected_version == NO_STREAM {
        return Err(DomainError::AggregateCreation { aggregate_key });
    }
    let actual = last_target.saturating_add(1);
    if actual != expected_version {
        return Err(DomainError::ConcurrencyConflict {
            aggregate_key,
            expected: expected_version,
            actual,
        });
    }
    Ok(())
}

/// Event stream persistence backing the aggregate repository.
#[async_trait]
pub trait EventStorageProvider: Send + Sync {
    /// Load up to `count` events of a stream whose target version is at
    /// least `start_version`, ordered by target version.
    async fn get_events(
        &self,
        aggregate_key: Uuid,
        start_version: i16,
        count: usize,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Load up to `count` events caused by a command, ordered by target
    /// version.
    async fn get_events_by_correlation(
        &self,
        correlation_key: Uuid,
        application_key: Uuid,
        start_version: i16,
        count: usize,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Load the event with the highest target version of a stream.
    async fn get_last_event(&self, aggregate_key: Uuid)
    -> Result<Option<StoredEvent>, DomainError>;

    /// Atomically append a commit as pending outbox records, re-checking the
    /// expected version against storage.
    async fn commit_changes(&self, commit: &Commit) -> Result<(), DomainError>;
}

/// Exclusive right to drain an outbox, shared by every process using it.
///
/// Dropping a lease without releasing it still gives it up, possibly later.
#[async_trait]
pub trait PublisherLease: Send {
    /// Give the lease back.
    async fn release(&mut self) -> Result<(), DomainError>;
}

/// Outbox access used by the event log publisher.
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Load up to `batch_size` pending records, oldest commit first.
    async fn get_pending(&self, batch_size: usize) -> Result<Vec<StoredEvent>, DomainError>;

    /// Flip a pending record to dispatched and bump its send counter.
    async fn mark_dispatched(&self, event_key: Uuid) -> Result<(), DomainError>;

    /// Take the publisher lease without waiting. `None` means another
    /// publisher holds it.
    async fn try_acquire_publisher_lease(
        &self,
    ) -> Result<Option<Box<dyn PublisherLease>>, DomainError>;
}

/// Snapshot persistence.
#[async_trait]
pub trait SnapshotStorageProvider: Send + Sync {
    /// Load the latest snapshot of an aggregate.
    async fn get_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_key: Uuid,
    ) -> Result<Option<Snapshot>, DomainError>;

    /// Store a snapshot, replacing any older one for the same aggregate.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_state_discriminants() {
        assert_eq!(OutboxState::Pending.as_i16(), 0);
        assert_eq!(OutboxState::Dispatched.as_i16(), 1);
        assert_eq!(OutboxState::from_i16(1).unwrap(), OutboxState::Dispatched);
        assert!(OutboxState::from_i16(7).is_err());
    }

    #[test]
    fn test_check_expected_version_accepts_empty_stream() {
        assert!(check_expected_version(Uuid::new_v4(), NO_STREAM, None).is_ok());
    }

    #[test]
    fn test_check_expected_version_rejects_recreation() {
        let key = Uuid::new_v4();

        let result = check_expected_version(key, NO_STREAM, Some(0));

        match result {
            Err(DomainError::AggregateCreation { aggregate_key }) => assert_eq!(aggregate_key, key),
            other => panic!("expected AggregateCreation, got {other:?}"),
        }
    }

    #[test]
    fn test_check_expected_version_rejects_stale_writer() {
        let key = Uuid::new_v4();

        assert!(check_expected_version(key, 5, Some(4)).is_ok());
        match check_expected_version(key, 3, Some(4)) {
            Err(DomainError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 5);
            }
            other => panic!("expected ConcurrencyConflict, got {other:?}"),
        }
    }
}
