//! Domain event abstractions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::NO_STREAM;
use crate::error::DomainError;
use crate::key::new_key;
use crate::message::Message;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Globally unique, time-ordered event identifier.
    pub event_key: Uuid,
    /// Aggregate/stream this event belongs to.
    pub aggregate_key: Uuid,
    /// Client application that issued the causing command.
    pub application_key: Uuid,
    /// Correlation key shared with the causing command.
    pub correlation_key: Uuid,
    /// Long-running process this event belongs to, if any.
    pub saga_process_key: Option<Uuid>,
    /// Aggregate version this event extends (the version before applying it).
    pub target_version: i16,
    /// Schema version of the event payload.
    pub class_version: i8,
    /// Commit time, set when the event is persisted.
    pub committed_at: Option<DateTime<Utc>>,
}

impl EventMetadata {
    /// Creates metadata for a new, uncommitted event.
    ///
    /// The target version is filled in when the event is applied.
    #[must_use]
    pub fn new(aggregate_key: Uuid, application_key: Uuid, correlation_key: Uuid) -> Self {
        Self {
            event_key: new_key(),
            aggregate_key,
            application_key,
            correlation_key,
            saga_process_key: None,
            target_version: NO_STREAM,
            class_version: 1,
            committed_at: None,
        }
    }

    /// Links the event to a long-running process.
    #[must_use]
    pub fn with_saga_process(mut self, saga_process_key: Uuid) -> Self {
        self.saga_process_key = Some(saga_process_key);
        self
    }

    /// Overrides the payload schema version.
    #[must_use]
    pub fn with_class_version(mut self, class_version: i8) -> Self {
        self.class_version = class_version;
        self
    }
}

/// The closed set of events an aggregate type produces and consumes.
///
/// Implemented by an enum with one variant per concrete event. The type name
/// returned by [`EventKind::event_type`] is the discriminator persisted next to
/// the payload and used to route the event on the bus.
pub trait EventKind: Clone + fmt::Debug + Send + Sync + 'static {
    /// Type name of the concrete event held by this value.
    fn event_type(&self) -> &'static str;

    /// Serializes the concrete event's payload (without the enum wrapper).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    fn to_body(&self) -> Result<serde_json::Value, DomainError>;

    /// Rebuilds the concrete event named by `event_type` from its payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if `event_type` is unknown or the
    /// payload does not match it.
    fn from_body(event_type: &str, body: serde_json::Value) -> Result<Self, DomainError>;
}

/// Links a concrete event payload to its variant inside an [`EventKind`].
pub trait EventVariant<K: EventKind>: Message {
    /// Borrows the payload if `kind` holds this variant.
    fn extract(kind: &K) -> Option<&Self>;
}

/// A domain event: metadata plus the concrete payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<K> {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: K,
}

impl<K: EventKind> Event<K> {
    /// Wraps a payload with its metadata.
    #[must_use]
    pub fn new(metadata: EventMetadata, kind: K) -> Self {
        Self { metadata, kind }
    }

    /// The discriminator of the wrapped payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Builds the `from_body` error for an unknown discriminator.
#[must_use]
pub fn unknown_event_type(aggregate_type: &str, event_type: &str) -> DomainError {
    DomainError::Serialization(format!(
        "unknown event type {event_type:?} for aggregate type {aggregate_type}"
    ))
}
