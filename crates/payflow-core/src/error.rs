//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

use crate::notification::Notification;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// A stream already exists for an aggregate that expected to create it.
    #[error("aggregate {aggregate_key} already exists; creation rejected")]
    AggregateCreation {
        /// The aggregate whose stream was already present.
        aggregate_key: Uuid,
    },

    /// Optimistic concurrency conflict.
    #[error(
        "concurrency conflict on aggregate {aggregate_key}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_key: Uuid,
        /// The version the in-memory aggregate expected storage to be at.
        expected: i16,
        /// The version implied by the last persisted event.
        actual: i16,
    },

    /// An event does not fit the aggregate it is being applied to.
    #[error(
        "event for aggregate {event_aggregate_key} targeting version {target_version} cannot be applied to aggregate {aggregate_key:?} at version {current_version}"
    )]
    AggregateStateMismatch {
        /// Key of the aggregate, if it already owns a stream.
        aggregate_key: Option<Uuid>,
        /// Key carried by the event.
        event_aggregate_key: Uuid,
        /// Version the aggregate is at.
        current_version: i16,
        /// Version the event targets.
        target_version: i16,
    },

    /// No apply handler is registered for an event type.
    #[error("aggregate type {aggregate_type} has no apply handler for event {event_type}")]
    ApplyHandlerMissing {
        /// The aggregate type name.
        aggregate_type: &'static str,
        /// The event type name.
        event_type: String,
    },

    /// The command was already processed.
    #[error(
        "duplicate command (correlation {correlation_key}, application {application_key}); original aggregate {original_aggregate_key}"
    )]
    Duplicate {
        /// The aggregate created by the first processing of the command.
        original_aggregate_key: Uuid,
        /// Correlation key of the duplicated command.
        correlation_key: Uuid,
        /// Application key of the duplicated command.
        application_key: Uuid,
    },

    /// Scheduling or dispatch infrastructure failed.
    #[error("command execution failed: {0}")]
    CommandExecutionFailed(String),

    /// Read-path infrastructure failed.
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    /// Validation failures collected before any persistence attempt.
    #[error("validation failed: {0}")]
    Validation(Notification),

    /// Wiring error detected at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` for [`DomainError::Duplicate`].
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    /// The aggregate a duplicate command originally produced, if this is a
    /// duplicate.
    #[must_use]
    pub fn original_aggregate_key(&self) -> Option<Uuid> {
        match self {
            Self::Duplicate {
                original_aggregate_key,
                ..
            } => Some(*original_aggregate_key),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_exposes_original_aggregate_key() {
        let original = Uuid::new_v4();
        let err = DomainError::Duplicate {
            original_aggregate_key: original,
            correlation_key: Uuid::new_v4(),
            application_key: Uuid::new_v4(),
        };

        assert!(err.is_duplicate());
        assert_eq!(err.original_aggregate_key(), Some(original));
    }

    #[test]
    fn test_other_errors_are_not_duplicates() {
        let err = DomainError::Infrastructure("db down".into());

        assert!(!err.is_duplicate());
        assert_eq!(err.original_aggregate_key(), None);
    }
}
