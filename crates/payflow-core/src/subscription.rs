//! Subscription bookkeeping.
//!
//! Subscriptions are keyed by message type *name*, never by a Rust type, so
//! the same manager can sit in front of an in-process dispatcher or a broker
//! client. Removing the last handler for a name broadcasts that name so
//! transport adapters can retract their routing rules.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::error::DomainError;

/// Capacity of the removal notification channel.
const REMOVAL_CHANNEL_CAPACITY: usize = 64;

/// One registered handler for a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Name identifying the handler implementation.
    pub handler_type: String,
    /// Whether the handler receives raw, untyped payloads.
    pub is_dynamic: bool,
}

/// Bookkeeping of message-type-name to handler registrations.
pub trait SubscriptionManager: Send + Sync {
    /// Returns `true` if nothing is registered.
    fn is_empty(&self) -> bool;

    /// Register a strongly typed handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if the handler is already
    /// registered for the message type.
    fn add_subscription(&self, message_type: &str, handler_type: &str) -> Result<(), DomainError>;

    /// Register a dynamic handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if the handler is already
    /// registered for the message type.
    fn add_dynamic_subscription(
        &self,
        message_type: &str,
        handler_type: &str,
    ) -> Result<(), DomainError>;

    /// Remove a handler; returns whether it was registered.
    fn remove_subscription(&self, message_type: &str, handler_type: &str) -> bool;

    /// Returns `true` if at least one handler is registered for the type.
    fn has_subscriptions_for(&self, message_type: &str) -> bool;

    /// Handlers registered for the type, in registration order.
    fn handlers_for(&self, message_type: &str) -> Vec<SubscriptionInfo>;

    /// Every message type with at least one handler.
    fn message_types(&self) -> Vec<String>;

    /// Remove every registration.
    fn clear(&self);

    /// Notifications carrying the names of message types that lost their last
    /// handler.
    fn subscribe_removals(&self) -> broadcast::Receiver<String>;
}

/// In-memory [`SubscriptionManager`].
#[derive(Debug)]
pub struct InMemorySubscriptionManager {
    handlers: RwLock<HashMap<String, Vec<SubscriptionInfo>>>,
    removed: broadcast::Sender<String>,
}

impl Default for InMemorySubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubscriptionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        let (removed, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            removed,
        }
    }

    fn add(
        &self,
        message_type: &str,
        handler_type: &str,
        is_dynamic: bool,
    ) -> Result<(), DomainError> {
        if message_type.trim().is_empty() {
            return Err(DomainError::Configuration(
                "cannot subscribe to an empty message type name".to_owned(),
            ));
        }
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = handlers.entry(message_type.to_owned()).or_default();
        if registered.iter().any(|s| s.handler_type == handler_type) {
            return Err(DomainError::Configuration(format!(
                "handler {handler_type} is already registered for {message_type}"
            )));
        }
        registered.push(SubscriptionInfo {
            handler_type: handler_type.to_owned(),
            is_dynamic,
        });
        Ok(())
    }
}

impl SubscriptionManager for InMemorySubscriptionManager {
    fn is_empty(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn add_subscription(&self, message_type: &str, handler_type: &str) -> Result<(), DomainError> {
        self.add(message_type, handler_type, false)
    }

    fn add_dynamic_subscription(
        &self,
        message_type: &str,
        handler_type: &str,
    ) -> Result<(), DomainError> {
        self.add(message_type, handler_type, true)
    }

    fn remove_subscription(&self, message_type: &str, handler_type: &str) -> bool {
        let emptied = {
            let mut handlers = self
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(registered) = handlers.get_mut(message_type) else {
                return false;
            };
            let before = registered.len();
            registered.retain(|s| s.handler_type != handler_type);
            if registered.len() == before {
                return false;
            }
            if registered.is_empty() {
                handlers.remove(message_type);
                true
            } else {
                false
            }
        };
        if emptied {
            tracing::debug!(message_type, "last handler removed");
            // No receivers is fine: nobody needs to retract anything.
            let _ = self.removed.send(message_type.to_owned());
        }
        true
    }

    fn has_subscriptions_for(&self, message_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(message_type)
    }

    fn handlers_for(&self, message_type: &str) -> Vec<SubscriptionInfo> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn subscribe_removals(&self) -> broadcast::Receiver<String> {
        self.removed.subscribe()
    }
}
