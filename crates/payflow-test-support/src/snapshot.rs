//! In-memory snapshot store — a `SnapshotStorageProvider` that records every
//! save.

use std::sync::Mutex;

use async_trait::async_trait;
use payflow_core::error::DomainError;
use payflow_core::storage::{Snapshot, SnapshotStorageProvider};
use uuid::Uuid;

/// A snapshot store that keeps every saved snapshot and serves the latest.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    saved: Mutex<Vec<Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot saved so far, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn saved(&self) -> Vec<Snapshot> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotStorageProvider for InMemorySnapshotStore {
    async fn get_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_key: Uuid,
    ) -> Result<Option<Snapshot>, DomainError> {
        Ok(self
            .saved
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.aggregate_type == aggregate_type && s.aggregate_key == aggregate_key)
            .max_by_key(|s| s.version)
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        self.saved.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}
