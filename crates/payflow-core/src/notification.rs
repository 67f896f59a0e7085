//! Validation notification list.
//!
//! Command validation collects every failure instead of stopping at the
//! first one, so callers can report them together before anything is
//! persisted.

use std::fmt;

use serde::Serialize;

use crate::error::DomainError;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

/// An ordered collection of validation failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Notification {
    failures: Vec<ValidationFailure>,
}

impl Notification {
    /// Creates an empty notification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for `field`.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.failures.push(ValidationFailure {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Records a failure for `field` when `condition` is false.
    pub fn require(&mut self, condition: bool, field: &str, message: &str) {
        if !condition {
            self.add(field, message);
        }
    }

    /// Returns `true` if any failure was recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The recorded failures, in insertion order.
    #[must_use]
    pub fn failures(&self) -> &[ValidationFailure] {
        &self.failures
    }

    /// Converts the notification into a result.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` carrying this notification if any
    /// failure was recorded.
    pub fn into_result(self) -> Result<(), DomainError> {
        if self.has_errors() {
            Err(DomainError::Validation(self))
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for failure in &self.failures {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.field, failure.message)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_notification_is_ok() {
        assert!(Notification::new().into_result().is_ok());
    }

    #[test]
    fn test_failures_are_collected_in_order() {
        // Arrange
        let mut notification = Notification::new();

        // Act
        notification.require(false, "name", "must not be empty");
        notification.require(true, "ignored", "never recorded");
        notification.add("amount", "must be positive");

        // Assert
        assert_eq!(notification.failures().len(), 2);
        assert_eq!(
            notification.to_string(),
            "name: must not be empty; amount: must be positive"
        );
        match notification.into_result() {
            Err(DomainError::Validation(n)) => assert_eq!(n.failures()[1].field, "amount"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }
}
