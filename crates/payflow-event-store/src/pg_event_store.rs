//! `PostgreSQL` implementation of the event storage and outbox traits.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use payflow_core::codec;
use payflow_core::error::DomainError;
use payflow_core::key::{format_key, parse_key};
use payflow_core::storage::{
    Commit, EventStorageProvider, OutboxState, OutboxStorage, PublisherLease, StoredEvent,
    check_expected_version,
};

use crate::error::{Violation, infrastructure_error, query_error, violation};
use crate::schema::PUBLISHER_LOCK_KEY;

/// PostgreSQL-backed event store and outbox.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn last_target_version(&self, aggregate_key: Uuid) -> Result<Option<i16>, DomainError> {
        let (last,): (Option<i16>,) = sqlx::query_as(
            "SELECT MAX(target_version) FROM outbox_events WHERE aggregate_key = $1",
        )
        .bind(format_key(aggregate_key))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("reading stream position", &e))?;
        Ok(last)
    }

    async fn original_aggregate(
        &self,
        application_key: Uuid,
        correlation_key: Uuid,
    ) -> Result<Uuid, DomainError> {
        let (aggregate_key,): (String,) = sqlx::query_as(
            "SELECT aggregate_key FROM outbox_events \
             WHERE application_key = $1 AND correlation_key = $2 \
             LIMIT 1",
        )
        .bind(format_key(application_key))
        .bind(format_key(correlation_key))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("locating original aggregate", &e))?;
        parse_key(&aggregate_key)
    }

    /// Turns a failed insert into the domain error the caller expects.
    async fn insert_failure(
        &self,
        commit: &Commit,
        event: &StoredEvent,
        err: &sqlx::Error,
    ) -> DomainError {
        match violation(err) {
            Some(Violation::Correlation) => {
                let meta = &event.metadata;
                match self
                    .original_aggregate(meta.application_key, meta.correlation_key)
                    .await
                {
                    Ok(original_aggregate_key) => DomainError::Duplicate {
                        original_aggregate_key,
                        correlation_key: meta.correlation_key,
                        application_key: meta.application_key,
                    },
                    Err(lookup) => lookup,
                }
            }
            Some(Violation::StreamPosition) => {
                let actual = self
                    .last_target_version(commit.aggregate_key)
                    .await
                    .ok()
                    .flatten()
                    .map_or(commit.expected_version, |last| last.saturating_add(1));
                DomainError::ConcurrencyConflict {
                    aggregate_key: commit.aggregate_key,
                    expected: commit.expected_version,
                    actual,
                }
            }
            None => infrastructure_error("appending events", err),
        }
    }
}

/// Holds a transaction-scoped advisory lock; ending the transaction frees it.
struct PgPublisherLease {
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl PublisherLease for PgPublisherLease {
    async fn release(&mut self) -> Result<(), DomainError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| infrastructure_error("releasing publisher lock", &e))?;
        }
        Ok(())
    }
}

fn limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn decode_row(row: &PgRow) -> Result<StoredEvent, DomainError> {
    let payload: String = row
        .try_get("payload")
        .map_err(|e| query_error("reading payload", &e))?;
    let times_sent: i16 = row
        .try_get("times_sent")
        .map_err(|e| query_error("reading times_sent", &e))?;
    let state: i16 = row
        .try_get("state")
        .map_err(|e| query_error("reading state", &e))?;
    codec::decode_event(&payload, times_sent, OutboxState::from_i16(state)?)
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<StoredEvent>, DomainError> {
    rows.iter().map(decode_row).collect()
}

#[async_trait]
impl EventStorageProvider for PgEventStore {
    async fn get_events(
        &self,
        aggregate_key: Uuid,
        start_version: i16,
        count: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query(
            "SELECT payload, times_sent, state FROM outbox_events \
             WHERE aggregate_key = $1 AND target_version >= $2 \
             ORDER BY target_version LIMIT $3",
        )
        .bind(format_key(aggregate_key))
        .bind(start_version)
        .bind(limit(count))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("loading stream", &e))?;
        decode_rows(&rows)
    }

    async fn get_events_by_correlation(
        &self,
        correlation_key: Uuid,
        application_key: Uuid,
        start_version: i16,
        count: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query(
            "SELECT payload, times_sent, state FROM outbox_events \
             WHERE correlation_key = $1 AND application_key = $2 AND target_version >= $3 \
             ORDER BY target_version LIMIT $4",
        )
        .bind(format_key(correlation_key))
        .bind(format_key(application_key))
        .bind(start_version)
        .bind(limit(count))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("loading correlated events", &e))?;
        decode_rows(&rows)
    }

    async fn get_last_event(
        &self,
        aggregate_key: Uuid,
    ) -> Result<Option<StoredEvent>, DomainError> {
        let row = sqlx::query(
            "SELECT payload, times_sent, state FROM outbox_events \
             WHERE aggregate_key = $1 ORDER BY target_version DESC LIMIT 1",
        )
        .bind(format_key(aggregate_key))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("loading last event", &e))?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn commit_changes(&self, commit: &Commit) -> Result<(), DomainError> {
        if commit.events.is_empty() {
            return Ok(());
        }
        let stream_key = format_key(commit.aggregate_key);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| infrastructure_error("starting transaction", &e))?;

        let (last_target,): (Option<i16>,) = sqlx::query_as(
            "SELECT MAX(target_version) FROM outbox_events WHERE aggregate_key = $1",
        )
        .bind(&stream_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| query_error("reading stream position", &e))?;
        check_expected_version(commit.aggregate_key, commit.expected_version, last_target)?;

        for event in &commit.events {
            let meta = &event.metadata;
            let inserted = sqlx::query(
                "INSERT INTO outbox_events (\
                     event_key, state, aggregate_key, application_key, correlation_key, \
                     target_version, class_version, committed_at, payload, times_sent\
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)",
            )
            .bind(format_key(meta.event_key))
            .bind(OutboxState::Pending.as_i16())
            .bind(&stream_key)
            .bind(format_key(meta.application_key))
            .bind(format_key(meta.correlation_key))
            .bind(meta.target_version)
            .bind(i16::from(meta.class_version))
            .bind(event.committed_at()?)
            .bind(codec::encode_event(event)?)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed append failed");
                }
                return Err(self.insert_failure(commit, event, &e).await);
            }
        }

        tx.commit()
            .await
            .map_err(|e| infrastructure_error("committing events", &e))?;
        tracing::debug!(
            aggregate_key = %commit.aggregate_key,
            aggregate_type = %commit.aggregate_type,
            events = commit.events.len(),
            "events appended"
        );
        Ok(())
    }
}

#[async_trait]
impl OutboxStorage for PgEventStore {
    async fn get_pending(&self, batch_size: usize) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query(
            "SELECT payload, times_sent, state FROM outbox_events \
             WHERE state = $1 ORDER BY committed_at, event_key LIMIT $2",
        )
        .bind(OutboxState::Pending.as_i16())
        .bind(limit(batch_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("loading pending events", &e))?;
        decode_rows(&rows)
    }

    async fn mark_dispatched(&self, event_key: Uuid) -> Result<(), DomainError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET state = $1, times_sent = times_sent + 1 \
             WHERE event_key = $2 AND state = $3",
        )
        .bind(OutboxState::Dispatched.as_i16())
        .bind(format_key(event_key))
        .bind(OutboxState::Pending.as_i16())
        .execute(&self.pool)
        .await
        .map_err(|e| infrastructure_error("marking event dispatched", &e))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Infrastructure(format!(
                "no pending outbox record {event_key}"
            )));
        }
        Ok(())
    }

    async fn try_acquire_publisher_lease(
        &self,
    ) -> Result<Option<Box<dyn PublisherLease>>, DomainError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| infrastructure_error("starting publisher lock transaction", &e))?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(PUBLISHER_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| infrastructure_error("taking publisher lock", &e))?;

        if !locked {
            tx.rollback()
                .await
                .map_err(|e| infrastructure_error("ending publisher lock transaction", &e))?;
            tracing::debug!("publisher lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(Box::new(PgPublisherLease { tx: Some(tx) })))
    }
}
