//! Test buses — mock `MessageBus` implementations for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::bus::MessageBus;
use payflow_core::error::DomainError;
use payflow_core::message::RawMessage;

/// A bus that records every command and event it is given. It can be told to
/// fail the N-th event publish (1-based, counted over the bus lifetime).
#[derive(Debug, Default)]
pub struct RecordingBus {
    commands: Mutex<Vec<(RawMessage, Option<DateTime<Utc>>)>>,
    events: Mutex<Vec<RawMessage>>,
    raise_attempts: AtomicUsize,
    fail_on_raise: Mutex<Option<usize>>,
    command_error: Mutex<Option<fn() -> DomainError>>,
}

impl RecordingBus {
    /// Create a bus that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus whose `attempt`-th `raise_event` call fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn failing_on_raise(attempt: usize) -> Self {
        let bus = Self::default();
        *bus.fail_on_raise.lock().unwrap() = Some(attempt);
        bus
    }

    /// Make every `send_command` call fail with the error built by `error`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_commands_with(&self, error: fn() -> DomainError) {
        *self.command_error.lock().unwrap() = Some(error);
    }

    /// Events successfully raised, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn raised_events(&self) -> Vec<RawMessage> {
        self.events.lock().unwrap().clone()
    }

    /// Commands sent, with their schedule, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn sent_commands(&self) -> Vec<(RawMessage, Option<DateTime<Utc>>)> {
        self.commands.lock().unwrap().clone()
    }

    /// Number of `raise_event` calls, successful or not.
    pub fn raise_attempts(&self) -> usize {
        self.raise_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn send_command(
        &self,
        command: RawMessage,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError> {
        self.commands
            .lock()
            .unwrap()
            .push((command, scheduled_at));
        let error = *self.command_error.lock().unwrap();
        match error {
            Some(build) => Err(build()),
            None => Ok(()),
        }
    }

    async fn raise_event(&self, event: RawMessage) -> Result<(), DomainError> {
        let attempt = self.raise_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on_raise.lock().unwrap() == Some(attempt) {
            return Err(DomainError::Infrastructure(format!(
                "broker unavailable for {}",
                event.message_type
            )));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// A bus that always returns an infrastructure error.
#[derive(Debug)]
pub struct FailingBus;

#[async_trait]
impl MessageBus for FailingBus {
    async fn send_command(
        &self,
        _command: RawMessage,
        _scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure("broker unavailable".into()))
    }

    async fn raise_event(&self, _event: RawMessage) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure("broker unavailable".into()))
    }
}
