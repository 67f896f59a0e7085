//! Command and event bus abstractions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::command::Command;
use crate::error::DomainError;
use crate::message::{EventEnvelope, Message, RawMessage};

/// Transport-agnostic bus consumed by command handlers and the outbox
/// publisher.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Route a command to its single handler, now or at `scheduled_at`.
    async fn send_command(
        &self,
        command: RawMessage,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError>;

    /// Fan an event out to every subscriber of its type.
    async fn raise_event(&self, event: RawMessage) -> Result<(), DomainError>;
}

/// Sends a typed command for immediate handling.
///
/// # Errors
///
/// Returns `DomainError::Serialization` if the command cannot be encoded, or
/// whatever the bus returns.
pub async fn send<C: Command>(bus: &dyn MessageBus, command: &C) -> Result<(), DomainError> {
    bus.send_command(RawMessage::command(command)?, None).await
}

/// Sends a typed command for delivery at `scheduled_at`.
///
/// # Errors
///
/// See [`send`].
pub async fn send_at<C: Command>(
    bus: &dyn MessageBus,
    command: &C,
    scheduled_at: DateTime<Utc>,
) -> Result<(), DomainError> {
    bus.send_command(RawMessage::command(command)?, Some(scheduled_at))
        .await
}

/// Handles exactly one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Execute the command.
    async fn handle(&self, command: C) -> Result<(), DomainError>;
}

/// Strongly typed subscriber for one event payload type.
#[async_trait]
pub trait EventHandler<P: Message>: Send + Sync {
    /// React to the event.
    async fn handle(&self, event: EventEnvelope<P>) -> Result<(), DomainError>;
}

/// Late-bound subscriber receiving the raw message.
#[async_trait]
pub trait DynamicEventHandler: Send + Sync {
    /// React to the event.
    async fn handle(&self, event: RawMessage) -> Result<(), DomainError>;
}
