//! Payflow worker — error types.

use payflow_core::error::DomainError;
use thiserror::Error;

/// Startup and runtime errors for the worker.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Wiring the engine failed.
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    /// Signal handling or other I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}
