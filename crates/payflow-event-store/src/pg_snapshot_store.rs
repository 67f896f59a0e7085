//! `PostgreSQL` implementation of the snapshot storage trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use payflow_core::codec;
use payflow_core::error::DomainError;
use payflow_core::key::{format_key, parse_key};
use payflow_core::storage::{Snapshot, SnapshotStorageProvider};

use crate::error::{infrastructure_error, query_error};

/// PostgreSQL-backed snapshot store keeping the latest snapshot per aggregate.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStorageProvider for PgSnapshotStore {
    async fn get_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_key: Uuid,
    ) -> Result<Option<Snapshot>, DomainError> {
        let row: Option<(String, i16, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT snapshot_key, version, state, taken_at FROM snapshots \
             WHERE aggregate_type = $1 AND aggregate_key = $2",
        )
        .bind(aggregate_type)
        .bind(format_key(aggregate_key))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("loading snapshot", &e))?;

        let Some((snapshot_key, version, state, taken_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Snapshot {
            snapshot_key: parse_key(&snapshot_key)?,
            aggregate_key,
            aggregate_type: aggregate_type.to_owned(),
            version,
            state: codec::decode(&state)?,
            taken_at,
        }))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        // An older snapshot never replaces a newer one.
        sqlx::query(
            "INSERT INTO snapshots \
                 (aggregate_type, aggregate_key, snapshot_key, version, state, taken_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (aggregate_type, aggregate_key) DO UPDATE SET \
                 snapshot_key = EXCLUDED.snapshot_key, \
                 version = EXCLUDED.version, \
                 state = EXCLUDED.state, \
                 taken_at = EXCLUDED.taken_at \
             WHERE snapshots.version <= EXCLUDED.version",
        )
        .bind(&snapshot.aggregate_type)
        .bind(format_key(snapshot.aggregate_key))
        .bind(format_key(snapshot.snapshot_key))
        .bind(snapshot.version)
        .bind(codec::encode(&snapshot.state)?)
        .bind(snapshot.taken_at)
        .execute(&self.pool)
        .await
        .map_err(|e| infrastructure_error("saving snapshot", &e))?;
        Ok(())
    }
}
