//! Broker transport adapter.
//!
//! [`Transport`] is the seam to a message broker: named routes, delayed
//! publish, prefetch-bounded fetch and manual acknowledgment. [`TransportBus`]
//! publishes through it; [`TransportConsumer`] pulls deliveries and runs them
//! through a [`MessageDispatcher`] with a bounded number of concurrent handler
//! calls. A delivery is acknowledged only after its handlers succeed; failures
//! are logged and rejected with requeue so the broker's redelivery policy
//! applies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::bus::MessageBus;
use payflow_core::error::DomainError;
use payflow_core::message::RawMessage;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::dispatcher::MessageDispatcher;

/// A message handed out by the broker, pending acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned tag used to settle the delivery.
    pub delivery_tag: u64,
    /// The message.
    pub message: RawMessage,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
}

/// Minimal broker client contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message, optionally for delivery at a later time.
    async fn publish(
        &self,
        message: RawMessage,
        deliver_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError>;

    /// Start routing messages of this type name to the consumer.
    async fn declare_route(&self, message_type: &str) -> Result<(), DomainError>;

    /// Stop routing messages of this type name.
    async fn retract_route(&self, message_type: &str) -> Result<(), DomainError>;

    /// Take up to `max` ready messages.
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, DomainError>;

    /// Settle a delivery as processed.
    async fn ack(&self, delivery_tag: u64) -> Result<(), DomainError>;

    /// Settle a delivery as failed, optionally asking for redelivery.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), DomainError>;
}

/// A [`MessageBus`] that publishes to a broker.
pub struct TransportBus {
    transport: Arc<dyn Transport>,
}

impl TransportBus {
    /// Create a bus over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl MessageBus for TransportBus {
    async fn send_command(
        &self,
        command: RawMessage,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError> {
        self.transport.publish(command, scheduled_at).await
    }

    async fn raise_event(&self, event: RawMessage) -> Result<(), DomainError> {
        self.transport.publish(event, None).await
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Handler invocations allowed to run at once.
    pub max_concurrent_calls: usize,
    /// Deliveries fetched per poll.
    pub prefetch_count: usize,
    /// Sleep between polls that found nothing.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            prefetch_count: 16,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acked,
    Requeued,
    Unsettled,
}

/// Result of one poll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Deliveries handled and acknowledged.
    pub acked: usize,
    /// Deliveries whose handlers failed and that were handed back.
    pub requeued: usize,
    /// Deliveries the broker could not settle.
    pub unsettled: usize,
}

impl PollOutcome {
    /// Returns `true` if nothing was fetched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acked + self.requeued + self.unsettled == 0
    }
}

/// Pulls deliveries from a [`Transport`] and dispatches them.
pub struct TransportConsumer {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<MessageDispatcher>,
    permits: Arc<Semaphore>,
    config: ConsumerConfig,
}

impl TransportConsumer {
    /// Create a consumer.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<MessageDispatcher>,
        config: ConsumerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
        Self {
            transport,
            dispatcher,
            permits,
            config,
        }
    }

    /// Declare a route for every command and event type the dispatcher
    /// handles.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub async fn declare_routes(&self) -> Result<(), DomainError> {
        for route in self.dispatcher.routes() {
            self.transport.declare_route(&route).await?;
        }
        Ok(())
    }

    /// Retract the broker route of every type name that loses its last
    /// subscriber, until the subscription manager is dropped.
    #[must_use]
    pub fn spawn_route_retraction(&self) -> JoinHandle<()> {
        let mut removals = self.dispatcher.subscriptions().subscribe_removals();
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            loop {
                match removals.recv().await {
                    Ok(message_type) => {
                        if let Err(e) = transport.retract_route(&message_type).await {
                            tracing::warn!(%message_type, error = %e, "route retraction failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed subscription removal notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Fetch one batch and handle it, at most `max_concurrent_calls` at a
    /// time. Returns once every delivery of the batch is settled.
    ///
    /// # Errors
    ///
    /// Returns the transport's fetch error.
    pub async fn poll_once(&self) -> Result<PollOutcome, DomainError> {
        let deliveries = self.transport.fetch(self.config.prefetch_count).await?;
        let mut tasks = JoinSet::new();
        for delivery in deliveries {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|e| DomainError::Infrastructure(e.to_string()))?;
            let dispatcher = Arc::clone(&self.dispatcher);
            let transport = Arc::clone(&self.transport);
            tasks.spawn(async move {
                let settlement = handle_delivery(&dispatcher, transport.as_ref(), delivery).await;
                drop(permit);
                settlement
            });
        }

        let mut outcome = PollOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Settlement::Acked) => outcome.acked += 1,
                Ok(Settlement::Requeued) => outcome.requeued += 1,
                Ok(Settlement::Unsettled) => outcome.unsettled += 1,
                Err(e) => {
                    tracing::error!(error = %e, "delivery task aborted");
                    outcome.unsettled += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let idle = match self.poll_once().await {
                Ok(outcome) => outcome.is_empty(),
                Err(e) => {
                    tracing::error!(error = %e, "transport fetch failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_delivery(
    dispatcher: &MessageDispatcher,
    transport: &dyn Transport,
    delivery: Delivery,
) -> Settlement {
    let tag = delivery.delivery_tag;
    let message_type = delivery.message.message_type.clone();
    match dispatcher.dispatch(delivery.message).await {
        Ok(()) => match transport.ack(tag).await {
            Ok(()) => {
                tracing::debug!(%message_type, delivery_tag = tag, "acked");
                Settlement::Acked
            }
            Err(e) => {
                tracing::error!(%message_type, delivery_tag = tag, error = %e, "ack failed");
                Settlement::Unsettled
            }
        },
        Err(e) => {
            tracing::error!(
                %message_type,
                delivery_tag = tag,
                redelivered = delivery.redelivered,
                error = %e,
                "handling failed; rejecting for redelivery"
            );
            match transport.reject(tag, true).await {
                Ok(()) => {
                    tracing::debug!(%message_type, delivery_tag = tag, "rejected");
                    Settlement::Requeued
                }
                Err(e) => {
                    tracing::error!(%message_type, delivery_tag = tag, error = %e, "reject failed");
                    Settlement::Unsettled
                }
            }
        }
    }
}
