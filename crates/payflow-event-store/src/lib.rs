//! Payflow Event Store — `PostgreSQL` persistence for the event log, the
//! transactional outbox and aggregate snapshots.
//!
//! Keys are stored as 32-character hex strings and payloads as compressed,
//! type-tagged envelopes produced by `payflow_core::codec`.

mod error;
pub mod pg_event_store;
pub mod pg_snapshot_store;
pub mod schema;

pub use pg_event_store::PgEventStore;
pub use pg_snapshot_store::PgSnapshotStore;
