//! In-memory event store — an `EventStorageProvider` and `OutboxStorage` that
//! enforces the same uniqueness and concurrency rules as the PostgreSQL store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use payflow_core::codec;
use payflow_core::error::DomainError;
use payflow_core::storage::{
    Commit, EventStorageProvider, OutboxState, OutboxStorage, PublisherLease, StoredEvent,
    check_expected_version,
};
use uuid::Uuid;

/// One persisted outbox row. The payload is kept encoded so the codec is
/// exercised on every read.
#[derive(Debug, Clone)]
struct Row {
    event_key: Uuid,
    aggregate_key: Uuid,
    application_key: Uuid,
    correlation_key: Uuid,
    target_version: i16,
    committed_at: chrono::DateTime<chrono::Utc>,
    payload: String,
    times_sent: i16,
    state: OutboxState,
}

impl Row {
    fn decode(&self) -> StoredEvent {
        codec::decode_event(&self.payload, self.times_sent, self.state)
            .expect("rows are encoded by this store")
    }
}

/// An event store holding its outbox in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    rows: Mutex<Vec<Row>>,
    fail_commits: AtomicBool,
    fail_reads: AtomicBool,
    leased: Arc<AtomicBool>,
}

/// Publisher lease over a flag shared with the store.
struct FlagLease(Option<Arc<AtomicBool>>);

#[async_trait]
impl PublisherLease for FlagLease {
    async fn release(&mut self) -> Result<(), DomainError> {
        if let Some(flag) = self.0.take() {
            flag.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for FlagLease {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `commit_changes` fail with an infrastructure
    /// error.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with a query error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Whether a publisher currently holds the lease.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::SeqCst)
    }

    /// Every persisted event, in append order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.rows.lock().unwrap().iter().map(Row::decode).collect()
    }

    /// Keys of the events still pending, in append order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn pending_keys(&self) -> Vec<Uuid> {
        self.keys_in(OutboxState::Pending)
    }

    /// Keys of the events already dispatched, in append order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn dispatched_keys(&self) -> Vec<Uuid> {
        self.keys_in(OutboxState::Dispatched)
    }

    /// Times the publisher sent the given event.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn times_sent(&self, event_key: Uuid) -> Option<i16> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.event_key == event_key)
            .map(|r| r.times_sent)
    }

    fn keys_in(&self, state: OutboxState) -> Vec<Uuid> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.event_key)
            .collect()
    }

    fn check_reads(&self) -> Result<(), DomainError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DomainError::QueryExecution("connection refused".into()));
        }
        Ok(())
    }

    fn select<F>(&self, filter: F, start_version: i16, count: usize) -> Vec<StoredEvent>
    where
        F: Fn(&Row) -> bool,
    {
        let rows = self.rows.lock().unwrap();
        let mut matching: Vec<&Row> = rows
            .iter()
            .filter(|r| filter(r) && r.target_version >= start_version)
            .collect();
        matching.sort_by_key(|r| r.target_version);
        matching.into_iter().take(count).map(Row::decode).collect()
    }
}

#[async_trait]
impl EventStorageProvider for InMemoryEventStore {
    async fn get_events(
        &self,
        aggregate_key: Uuid,
        start_version: i16,
        count: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.check_reads()?;
        Ok(self.select(|r| r.aggregate_key == aggregate_key, start_version, count))
    }

    async fn get_events_by_correlation(
        &self,
        correlation_key: Uuid,
        application_key: Uuid,
        start_version: i16,
        count: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.check_reads()?;
        Ok(self.select(
            |r| r.correlation_key == correlation_key && r.application_key == application_key,
            start_version,
            count,
        ))
    }

    async fn get_last_event(
        &self,
        aggregate_key: Uuid,
    ) -> Result<Option<StoredEvent>, DomainError> {
        self.check_reads()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| r.aggregate_key == aggregate_key)
            .max_by_key(|r| r.target_version)
            .map(Row::decode))
    }

    async fn commit_changes(&self, commit: &Commit) -> Result<(), DomainError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(DomainError::Infrastructure("connection refused".into()));
        }
        let mut rows = self.rows.lock().unwrap();

        let last_target = rows
            .iter()
            .filter(|r| r.aggregate_key == commit.aggregate_key)
            .map(|r| r.target_version)
            .max();
        check_expected_version(commit.aggregate_key, commit.expected_version, last_target)?;

        let mut staged: Vec<Row> = Vec::with_capacity(commit.events.len());
        for event in &commit.events {
            let meta = &event.metadata;
            let clash = rows.iter().chain(staged.iter()).find(|r| {
                r.application_key == meta.application_key
                    && r.correlation_key == meta.correlation_key
            });
            if let Some(existing) = clash {
                return Err(DomainError::Duplicate {
                    original_aggregate_key: existing.aggregate_key,
                    correlation_key: meta.correlation_key,
                    application_key: meta.application_key,
                });
            }
            staged.push(Row {
                event_key: meta.event_key,
                aggregate_key: meta.aggregate_key,
                application_key: meta.application_key,
                correlation_key: meta.correlation_key,
                target_version: meta.target_version,
                committed_at: event.committed_at()?,
                payload: codec::encode_event(event)?,
                times_sent: 0,
                state: OutboxState::Pending,
            });
        }
        rows.extend(staged);
        Ok(())
    }
}

#[async_trait]
impl OutboxStorage for InMemoryEventStore {
    async fn get_pending(&self, batch_size: usize) -> Result<Vec<StoredEvent>, DomainError> {
        self.check_reads()?;
        let rows = self.rows.lock().unwrap();
        let mut pending: Vec<&Row> = rows
            .iter()
            .filter(|r| r.state == OutboxState::Pending)
            .collect();
        pending.sort_by_key(|r| r.committed_at);
        Ok(pending.into_iter().take(batch_size).map(Row::decode).collect())
    }

    async fn mark_dispatched(&self, event_key: Uuid) -> Result<(), DomainError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.event_key == event_key && r.state == OutboxState::Pending)
            .ok_or_else(|| {
                DomainError::Infrastructure(format!("no pending outbox record {event_key}"))
            })?;
        row.times_sent += 1;
        row.state = OutboxState::Dispatched;
        Ok(())
    }

    async fn try_acquire_publisher_lease(
        &self,
    ) -> Result<Option<Box<dyn PublisherLease>>, DomainError> {
        let taken = self
            .leased
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        Ok(taken.then(|| {
            Box::new(FlagLease(Some(Arc::clone(&self.leased)))) as Box<dyn PublisherLease>
        }))
    }
}
