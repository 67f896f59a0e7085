//! Bus message types.
//!
//! Everything that crosses the bus travels as a [`RawMessage`]: a string type
//! name, an optional event metadata block and an unparsed JSON body. Typed
//! handlers decode the body into their concrete [`Message`]; dynamic handlers
//! receive the raw message as-is.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::EventMetadata;

/// A statically known message type (command or event payload).
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Transport-agnostic type name used for routing and subscriptions.
    const MESSAGE_TYPE: &'static str;
}

/// Whether a message must reach exactly one handler or fan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Routed to exactly one handler.
    Command,
    /// Fanned out to zero or more subscribers.
    Event,
}

/// An untyped message carrying its type discriminator and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Type name used for routing.
    pub message_type: String,
    /// Command or event.
    pub kind: MessageKind,
    /// Event metadata; present for events only.
    pub event: Option<EventMetadata>,
    /// Unparsed payload.
    pub body: serde_json::Value,
}

impl RawMessage {
    /// Wraps a typed command.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the command cannot be encoded.
    pub fn command<C: Message>(command: &C) -> Result<Self, DomainError> {
        Ok(Self {
            message_type: C::MESSAGE_TYPE.to_owned(),
            kind: MessageKind::Command,
            event: None,
            body: serde_json::to_value(command)?,
        })
    }

    /// Wraps an already-serialized event payload.
    #[must_use]
    pub fn event(
        message_type: impl Into<String>,
        metadata: EventMetadata,
        body: serde_json::Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            kind: MessageKind::Event,
            event: Some(metadata),
            body,
        }
    }

    /// Decodes the body into a concrete message type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the type name does not match or
    /// the body does not deserialize.
    pub fn decode<M: Message>(&self) -> Result<M, DomainError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(DomainError::Serialization(format!(
                "message type {} cannot be decoded as {}",
                self.message_type,
                M::MESSAGE_TYPE
            )));
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A decoded event delivered to a typed subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<P> {
    /// Metadata of the event.
    pub metadata: EventMetadata,
    /// The concrete payload.
    pub body: P,
}

impl<P: Message> EventEnvelope<P> {
    /// Decodes a raw event message.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the message is not an event of
    /// type `P`.
    pub fn from_raw(message: &RawMessage) -> Result<Self, DomainError> {
        let metadata = message.event.clone().ok_or_else(|| {
            DomainError::Serialization(format!(
                "message {} carries no event metadata",
                message.message_type
            ))
        })?;
        Ok(Self {
            metadata,
            body: message.decode()?,
        })
    }
}
