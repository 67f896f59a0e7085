//! Translation of `sqlx` failures into domain errors.

use payflow_core::error::DomainError;

use crate::schema::{CORRELATION_CONSTRAINT, STREAM_POSITION_CONSTRAINT};

/// Which uniqueness rule an insert broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Violation {
    /// The `(application_key, correlation_key)` pair already exists.
    Correlation,
    /// Another writer took the same stream position.
    StreamPosition,
}

/// Classifies a failed insert, if it broke one of the outbox constraints.
pub(crate) fn violation(err: &sqlx::Error) -> Option<Violation> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if !db_err.is_unique_violation() {
        return None;
    }
    match db_err.constraint() {
        Some(CORRELATION_CONSTRAINT) => Some(Violation::Correlation),
        Some(STREAM_POSITION_CONSTRAINT) => Some(Violation::StreamPosition),
        _ => None,
    }
}

/// Maps a read failure.
pub(crate) fn query_error(context: &str, err: &sqlx::Error) -> DomainError {
    DomainError::QueryExecution(format!("{context}: {err}"))
}

/// Maps a write or connection failure.
pub(crate) fn infrastructure_error(context: &str, err: &sqlx::Error) -> DomainError {
    DomainError::Infrastructure(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_not_violations() {
        assert_eq!(violation(&sqlx::Error::RowNotFound), None);
        assert_eq!(violation(&sqlx::Error::PoolTimedOut), None);
    }

    #[test]
    fn test_error_mapping_keeps_context() {
        let err = sqlx::Error::PoolTimedOut;

        let read = query_error("loading stream", &err);
        let write = infrastructure_error("committing", &err);

        assert!(matches!(&read, DomainError::QueryExecution(m) if m.starts_with("loading stream")));
        assert!(matches!(&write, DomainError::Infrastructure(m) if m.starts_with("committing")));
    }
}
