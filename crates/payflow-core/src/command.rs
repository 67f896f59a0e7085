//! Command abstractions.

use uuid::Uuid;

use crate::message::Message;
use crate::notification::Notification;

/// Trait that all commands implement.
pub trait Command: Message + std::fmt::Debug {
    /// Correlation key shared with every event this command causes.
    fn correlation_key(&self) -> Uuid;

    /// Client application that issued the command.
    fn application_key(&self) -> Uuid;

    /// The type name for this command (for logging/routing).
    fn command_type(&self) -> &'static str {
        Self::MESSAGE_TYPE
    }

    /// Collects validation failures; the default accepts everything.
    fn validate(&self) -> Notification {
        Notification::new()
    }
}
