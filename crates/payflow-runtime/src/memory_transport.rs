//! In-memory broker.
//!
//! Behaves like a single-queue broker: messages whose type has no declared
//! route are dropped, delayed messages become ready at their delivery time,
//! fetched messages stay in flight until acked or rejected, and a message
//! rejected too often is dead-lettered. Dropped and dead-lettered messages are
//! counted; only the most recent ones are retained for inspection.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::clock::Clock;
use payflow_core::error::DomainError;
use payflow_core::message::RawMessage;

use crate::transport::{Delivery, Transport};

const DEFAULT_MAX_DELIVERIES: u32 = 5;
const DEFAULT_RETAINED: usize = 100;

#[derive(Debug)]
struct Queued {
    message: RawMessage,
    deliver_at: Option<DateTime<Utc>>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Broker {
    routes: BTreeSet<String>,
    ready: VecDeque<Queued>,
    in_flight: HashMap<u64, Queued>,
    dead_letters: VecDeque<RawMessage>,
    dead_lettered: u64,
    unroutable: VecDeque<RawMessage>,
    dropped: u64,
    next_tag: u64,
}

fn retain(buffer: &mut VecDeque<RawMessage>, message: RawMessage, cap: usize) {
    if cap == 0 {
        return;
    }
    if buffer.len() == cap {
        buffer.pop_front();
    }
    buffer.push_back(message);
}

/// A [`Transport`] backed by process memory.
pub struct InMemoryTransport {
    broker: Mutex<Broker>,
    clock: Arc<dyn Clock>,
    max_deliveries: u32,
    retained: usize,
}

impl InMemoryTransport {
    /// Create an empty broker. Delayed messages are released by `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            broker: Mutex::new(Broker::default()),
            clock,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            retained: DEFAULT_RETAINED,
        }
    }

    /// Keep at most `retained` dropped and dead-lettered messages each.
    #[must_use]
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained;
        self
    }

    /// Dead-letter a message after it has been delivered this many times.
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Declared routes, sorted.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.broker().routes.iter().cloned().collect()
    }

    /// Messages waiting to be fetched, including delayed ones.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.broker().ready.len()
    }

    /// Fetched messages not yet settled.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.broker().in_flight.len()
    }

    /// The most recent messages that exhausted their deliveries or were
    /// rejected without requeue, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<RawMessage> {
        self.broker().dead_letters.iter().cloned().collect()
    }

    /// Total messages dead-lettered.
    #[must_use]
    pub fn dead_lettered_count(&self) -> u64 {
        self.broker().dead_lettered
    }

    /// The most recent messages dropped because no route was declared for
    /// their type, oldest first.
    #[must_use]
    pub fn unroutable(&self) -> Vec<RawMessage> {
        self.broker().unroutable.iter().cloned().collect()
    }

    /// Total messages dropped for lack of a route.
    #[must_use]
    pub fn unroutable_count(&self) -> u64 {
        self.broker().dropped
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unknown_tag(delivery_tag: u64) -> DomainError {
        DomainError::Infrastructure(format!("unknown delivery tag {delivery_tag}"))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        message: RawMessage,
        deliver_at: Option<DateTime<Utc>>,
    ) -> Result<(), DomainError> {
        let mut broker = self.broker();
        if !broker.routes.contains(&message.message_type) {
            broker.dropped += 1;
            tracing::debug!(
                message_type = %message.message_type,
                dropped = broker.dropped,
                "no route; message dropped"
            );
            retain(&mut broker.unroutable, message, self.retained);
            return Ok(());
        }
        broker.ready.push_back(Queued {
            message,
            deliver_at,
            deliveries: 0,
        });
        Ok(())
    }

    async fn declare_route(&self, message_type: &str) -> Result<(), DomainError> {
        self.broker().routes.insert(message_type.to_owned());
        Ok(())
    }

    async fn retract_route(&self, message_type: &str) -> Result<(), DomainError> {
        self.broker().routes.remove(message_type);
        Ok(())
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, DomainError> {
        let now = self.clock.now();
        let mut broker = self.broker();
        let mut deliveries = Vec::new();
        let mut waiting = VecDeque::new();
        while deliveries.len() < max {
            let Some(mut queued) = broker.ready.pop_front() else {
                break;
            };
            if queued.deliver_at.is_some_and(|at| at > now) {
                waiting.push_back(queued);
                continue;
            }
            queued.deliveries += 1;
            broker.next_tag += 1;
            let delivery_tag = broker.next_tag;
            deliveries.push(Delivery {
                delivery_tag,
                message: queued.message.clone(),
                redelivered: queued.deliveries > 1,
            });
            broker.in_flight.insert(delivery_tag, queued);
        }
        while let Some(queued) = waiting.pop_back() {
            broker.ready.push_front(queued);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DomainError> {
        self.broker()
            .in_flight
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| Self::unknown_tag(delivery_tag))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), DomainError> {
        let mut broker = self.broker();
        let queued = broker
            .in_flight
            .remove(&delivery_tag)
            .ok_or_else(|| Self::unknown_tag(delivery_tag))?;
        if requeue && queued.deliveries < self.max_deliveries {
            broker.ready.push_back(queued);
        } else {
            broker.dead_lettered += 1;
            tracing::warn!(
                message_type = %queued.message.message_type,
                deliveries = queued.deliveries,
                "message dead-lettered"
            );
            retain(&mut broker.dead_letters, queued.message, self.retained);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payflow_test_support::ManualClock;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Tick;

    impl payflow_core::message::Message for Tick {
        const MESSAGE_TYPE: &'static str = "test.tick";
    }

    fn tick() -> RawMessage {
        RawMessage::command(&Tick).unwrap()
    }

    #[tokio::test]
    async fn test_delayed_message_waits_for_its_time() {
        // Arrange
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = InMemoryTransport::new(Arc::clone(&clock) as Arc<dyn Clock>);
        transport.declare_route("test.tick").await.unwrap();
        let due = clock.now() + chrono::Duration::minutes(5);
        transport.publish(tick(), Some(due)).await.unwrap();
        transport.publish(tick(), None).await.unwrap();

        // Act
        let early = transport.fetch(10).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));
        let late = transport.fetch(10).await.unwrap();

        // Assert
        assert_eq!(early.len(), 1);
        assert_eq!(late.len(), 1);
        assert_eq!(transport.in_flight_len(), 2);
    }

    #[tokio::test]
    async fn test_ack_settles_and_unknown_tag_fails() {
        let transport = InMemoryTransport::new(Arc::new(ManualClock::new(Utc::now())));
        transport.declare_route("test.tick").await.unwrap();
        transport.publish(tick(), None).await.unwrap();
        let delivery = transport.fetch(1).await.unwrap().remove(0);

        transport.ack(delivery.delivery_tag).await.unwrap();

        assert!(!delivery.redelivered);
        assert_eq!(transport.in_flight_len(), 0);
        assert!(transport.ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let transport = InMemoryTransport::new(Arc::new(ManualClock::new(Utc::now())));
        transport.declare_route("test.tick").await.unwrap();
        transport.publish(tick(), None).await.unwrap();
        let delivery = transport.fetch(1).await.unwrap().remove(0);

        transport.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(transport.ready_len(), 0);
        assert_eq!(transport.dead_letters().len(), 1);
        assert_eq!(transport.dead_lettered_count(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_messages_are_counted_but_retention_is_bounded() {
        // Arrange
        let transport =
            InMemoryTransport::new(Arc::new(ManualClock::new(Utc::now()))).with_retention(3);

        // Act
        for _ in 0..1_000 {
            transport.publish(tick(), None).await.unwrap();
        }

        // Assert
        assert_eq!(transport.unroutable_count(), 1_000);
        assert_eq!(transport.unroutable().len(), 3);
        assert_eq!(transport.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_retention_keeps_the_latest() {
        let transport =
            InMemoryTransport::new(Arc::new(ManualClock::new(Utc::now()))).with_retention(2);
        transport.declare_route("test.tick").await.unwrap();
        for _ in 0..5 {
            transport.publish(tick(), None).await.unwrap();
        }

        for delivery in transport.fetch(5).await.unwrap() {
            transport.reject(delivery.delivery_tag, false).await.unwrap();
        }

        assert_eq!(transport.dead_lettered_count(), 5);
        assert_eq!(transport.dead_letters().len(), 2);
    }
}
