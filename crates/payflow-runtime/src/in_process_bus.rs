//! In-process message bus.
//!
//! Delivers commands and events directly through a [`MessageDispatcher`].
//! Delayed commands are held by a spawned task until their scheduled time.
//! That path is fire-and-forget. A failure is only logged, and a command
//! still waiting is lost when the process stops. Commands that must survive
//! failures go through [`CommandScheduler`](crate::scheduler::CommandScheduler).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::bus::MessageBus;
use payflow_core::clock::Clock;
use payflow_core::error::DomainError;
use payflow_core::message::RawMessage;

use crate::dispatcher::MessageDispatcher;

/// A [`MessageBus`] that calls handlers in the current process.
pub struct InProcessBus {
    dispatcher: Arc<MessageDispatcher>,
    clock: Arc<dyn Clock>,
}

impl InProcessBus {
    /// Create a bus over `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Arc<MessageDispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self { dispatcher, clock }
    }

    /// The dispatcher behind this bus.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn send_command(
        &self,
        command: RawMessage,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError> {
        let delay = scheduled_at.map(|at| self.clock.delay_until(at));
        match delay {
            Some(delay) if !delay.is_zero() => {
                let dispatcher = Arc::clone(&self.dispatcher);
                tracing::debug!(
                    command_type = %command.message_type,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "command scheduled"
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let command_type = command.message_type.clone();
                    if let Err(e) = dispatcher.dispatch_command(command).await {
                        tracing::warn!(
                            %command_type,
                            error = %e,
                            "delayed command failed; not retried"
                        );
                    }
                });
                Ok(())
            }
            _ => self.dispatcher.dispatch_command(command).await,
        }
    }

    async fn raise_event(&self, event: RawMessage) -> Result<(), DomainError> {
        self.dispatcher.dispatch_event(event).await
    }
}
