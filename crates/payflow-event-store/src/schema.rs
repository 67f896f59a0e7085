//! Event store database schema.
//!
//! The tables themselves are created by the migrations under the workspace
//! `migrations/` directory; this module names the pieces the stores refer to.

use sqlx::migrate::Migrator;

/// Migrations creating the outbox and snapshot tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Unique constraint making `(application_key, correlation_key)` the
/// command deduplication key.
pub const CORRELATION_CONSTRAINT: &str = "outbox_events_application_correlation_key";

/// Unique constraint allowing one event per stream position.
pub const STREAM_POSITION_CONSTRAINT: &str = "outbox_events_aggregate_version_key";

/// Advisory lock key serializing outbox publishers across processes.
pub const PUBLISHER_LOCK_KEY: i64 = 0x7061_7966_6c6f_7700;
