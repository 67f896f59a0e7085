//! In-process message dispatch.
//!
//! The dispatcher owns the handler instances and routes [`RawMessage`]s to
//! them: each command type name to exactly one handler, each event type name
//! to every subscriber the [`SubscriptionManager`] knows about. Typed handlers
//! are wrapped so they receive decoded payloads; dynamic handlers get the raw
//! message.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use payflow_core::bus::{CommandHandler, DynamicEventHandler, EventHandler};
use payflow_core::command::Command;
use payflow_core::error::DomainError;
use payflow_core::message::{EventEnvelope, Message, MessageKind, RawMessage};
use payflow_core::subscription::{InMemorySubscriptionManager, SubscriptionManager};

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle(&self, message: RawMessage) -> Result<(), DomainError>;
}

struct TypedCommand<C, H> {
    handler: Arc<H>,
    _command: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for TypedCommand<C, H>
where
    C: Command,
    H: CommandHandler<C> + 'static,
{
    async fn handle(&self, message: RawMessage) -> Result<(), DomainError> {
        let command: C = message.decode()?;
        self.handler.handle(command).await
    }
}

struct TypedEvent<P, H> {
    handler: Arc<H>,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, H> ErasedHandler for TypedEvent<P, H>
where
    P: Message,
    H: EventHandler<P> + 'static,
{
    async fn handle(&self, message: RawMessage) -> Result<(), DomainError> {
        let envelope = EventEnvelope::<P>::from_raw(&message)?;
        self.handler.handle(envelope).await
    }
}

struct Dynamic(Arc<dyn DynamicEventHandler>);

#[async_trait]
impl ErasedHandler for Dynamic {
    async fn handle(&self, message: RawMessage) -> Result<(), DomainError> {
        self.0.handle(message).await
    }
}

type EventKey = (String, String);

/// Routes raw messages to registered handlers.
pub struct MessageDispatcher {
    commands: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
    events: RwLock<HashMap<EventKey, Arc<dyn ErasedHandler>>>,
    subscriptions: Arc<dyn SubscriptionManager>,
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(InMemorySubscriptionManager::new()))
    }
}

impl MessageDispatcher {
    /// Create a dispatcher whose event routing is kept in `subscriptions`.
    #[must_use]
    pub fn new(subscriptions: Arc<dyn SubscriptionManager>) -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            subscriptions,
        }
    }

    /// The subscription bookkeeping behind event routing.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionManager> {
        &self.subscriptions
    }

    /// Register the single handler for command type `C`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if `C` already has a handler.
    pub fn register_command<C, H>(&self, handler: Arc<H>) -> Result<(), DomainError>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let mut commands = self
            .commands
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if commands.contains_key(C::MESSAGE_TYPE) {
            return Err(DomainError::Configuration(format!(
                "command {} already has a handler",
                C::MESSAGE_TYPE
            )));
        }
        commands.insert(
            C::MESSAGE_TYPE.to_owned(),
            Arc::new(TypedCommand::<C, H> {
                handler,
                _command: PhantomData,
            }),
        );
        Ok(())
    }

    /// Subscribe a typed handler to event payload `P`. The handler is
    /// identified by its Rust type name.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if the handler is already
    /// subscribed to `P`.
    pub fn subscribe<P, H>(&self, handler: Arc<H>) -> Result<(), DomainError>
    where
        P: Message,
        H: EventHandler<P> + 'static,
    {
        let handler_type = std::any::type_name::<H>();
        self.subscriptions
            .add_subscription(P::MESSAGE_TYPE, handler_type)?;
        self.insert_event_handler(
            P::MESSAGE_TYPE,
            handler_type,
            Arc::new(TypedEvent::<P, H> {
                handler,
                _payload: PhantomData,
            }),
        );
        Ok(())
    }

    /// Subscribe a dynamic handler to an event type name.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if `handler_type` is already
    /// subscribed to `message_type` or the name is empty.
    pub fn subscribe_dynamic(
        &self,
        message_type: &str,
        handler_type: &str,
        handler: Arc<dyn DynamicEventHandler>,
    ) -> Result<(), DomainError> {
        self.subscriptions
            .add_dynamic_subscription(message_type, handler_type)?;
        self.insert_event_handler(message_type, handler_type, Arc::new(Dynamic(handler)));
        Ok(())
    }

    /// Remove a subscriber; returns whether it was subscribed.
    pub fn unsubscribe(&self, message_type: &str, handler_type: &str) -> bool {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(message_type.to_owned(), handler_type.to_owned()));
        self.subscriptions
            .remove_subscription(message_type, handler_type)
    }

    /// Remove a typed subscriber registered with [`MessageDispatcher::subscribe`].
    pub fn unsubscribe_typed<P: Message, H: 'static>(&self) -> bool {
        self.unsubscribe(P::MESSAGE_TYPE, std::any::type_name::<H>())
    }

    /// Command type names with a registered handler, sorted.
    #[must_use]
    pub fn command_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Every message type name this dispatcher can route.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        let mut routes = self.command_types();
        routes.extend(self.subscriptions.message_types());
        routes
    }

    /// Route a message by its kind.
    ///
    /// # Errors
    ///
    /// See [`MessageDispatcher::dispatch_command`] and
    /// [`MessageDispatcher::dispatch_event`].
    pub async fn dispatch(&self, message: RawMessage) -> Result<(), DomainError> {
        match message.kind {
            MessageKind::Command => self.dispatch_command(message).await,
            MessageKind::Event => self.dispatch_event(message).await,
        }
    }

    /// Hand a command to its handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CommandExecutionFailed` if no handler is
    /// registered, or the handler's error.
    pub async fn dispatch_command(&self, message: RawMessage) -> Result<(), DomainError> {
        let handler = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.message_type)
            .cloned()
            .ok_or_else(|| {
                DomainError::CommandExecutionFailed(format!(
                    "no handler registered for command {}",
                    message.message_type
                ))
            })?;
        let message_type = message.message_type.clone();
        handler.handle(message).await.inspect_err(|e| {
            tracing::error!(command_type = %message_type, error = %e, "command handler failed");
        })
    }

    /// Hand an event to every subscriber. Every subscriber runs even if an
    /// earlier one fails; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first subscriber error.
    pub async fn dispatch_event(&self, message: RawMessage) -> Result<(), DomainError> {
        let handlers: Vec<(String, Arc<dyn ErasedHandler>)> = {
            let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
            self.subscriptions
                .handlers_for(&message.message_type)
                .into_iter()
                .filter_map(|info| {
                    events
                        .get(&(message.message_type.clone(), info.handler_type.clone()))
                        .map(|h| (info.handler_type, Arc::clone(h)))
                })
                .collect()
        };

        let mut first_error = None;
        for (handler_type, handler) in handlers {
            if let Err(e) = handler.handle(message.clone()).await {
                tracing::error!(
                    event_type = %message.message_type,
                    handler = %handler_type,
                    error = %e,
                    "event handler failed"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn insert_event_handler(
        &self,
        message_type: &str,
        handler_type: &str,
        handler: Arc<dyn ErasedHandler>,
    ) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((message_type.to_owned(), handler_type.to_owned()), handler);
    }
}
