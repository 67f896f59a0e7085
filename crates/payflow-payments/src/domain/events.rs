//! Domain events for the Payments context.

use payflow_core::error::DomainError;
use payflow_core::event::{EventKind, EventVariant, unknown_event_type};
use payflow_core::message::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emitted when a client application is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientApplicationCreated {
    /// Display name.
    pub name: String,
    /// Address notified about account activity.
    pub contact_email: String,
}

impl Message for ClientApplicationCreated {
    const MESSAGE_TYPE: &'static str = "payments.client_application_created";
}

/// Emitted when a client application changes its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientApplicationRenamed {
    /// The new display name.
    pub name: String,
}

impl Message for ClientApplicationRenamed {
    const MESSAGE_TYPE: &'static str = "payments.client_application_renamed";
}

/// Emitted when a client application is deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientApplicationDeactivated {
    /// Why it was deactivated.
    pub reason: String,
}

impl Message for ClientApplicationDeactivated {
    const MESSAGE_TYPE: &'static str = "payments.client_application_deactivated";
}

/// Event payload variants of the `ClientApplication` aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientApplicationEvent {
    /// A client application has been registered.
    Created(ClientApplicationCreated),
    /// A client application has been renamed.
    Renamed(ClientApplicationRenamed),
    /// A client application has been deactivated.
    Deactivated(ClientApplicationDeactivated),
}

impl EventKind for ClientApplicationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => ClientApplicationCreated::MESSAGE_TYPE,
            Self::Renamed(_) => ClientApplicationRenamed::MESSAGE_TYPE,
            Self::Deactivated(_) => ClientApplicationDeactivated::MESSAGE_TYPE,
        }
    }

    fn to_body(&self) -> Result<serde_json::Value, DomainError> {
        Ok(match self {
            Self::Created(e) => serde_json::to_value(e)?,
            Self::Renamed(e) => serde_json::to_value(e)?,
            Self::Deactivated(e) => serde_json::to_value(e)?,
        })
    }

    fn from_body(event_type: &str, body: serde_json::Value) -> Result<Self, DomainError> {
        match event_type {
            ClientApplicationCreated::MESSAGE_TYPE => {
                Ok(Self::Created(serde_json::from_value(body)?))
            }
            ClientApplicationRenamed::MESSAGE_TYPE => {
                Ok(Self::Renamed(serde_json::from_value(body)?))
            }
            ClientApplicationDeactivated::MESSAGE_TYPE => {
                Ok(Self::Deactivated(serde_json::from_value(body)?))
            }
            other => Err(unknown_event_type(
                crate::domain::aggregates::CLIENT_APPLICATION,
                other,
            )),
        }
    }
}

impl EventVariant<ClientApplicationEvent> for ClientApplicationCreated {
    fn extract(kind: &ClientApplicationEvent) -> Option<&Self> {
        match kind {
            ClientApplicationEvent::Created(e) => Some(e),
            _ => None,
        }
    }
}

impl EventVariant<ClientApplicationEvent> for ClientApplicationRenamed {
    fn extract(kind: &ClientApplicationEvent) -> Option<&Self> {
        match kind {
            ClientApplicationEvent::Renamed(e) => Some(e),
            _ => None,
        }
    }
}

impl EventVariant<ClientApplicationEvent> for ClientApplicationDeactivated {
    fn extract(kind: &ClientApplicationEvent) -> Option<&Self> {
        match kind {
            ClientApplicationEvent::Deactivated(e) => Some(e),
            _ => None,
        }
    }
}

/// Emitted when a charge is authorized for a client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeCreated {
    /// The client application the charge belongs to.
    pub client_application_key: Uuid,
    /// Authorized amount in minor currency units.
    pub amount_minor: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Seconds after creation at which the charge captures itself, if set.
    pub auto_capture_after_secs: Option<u32>,
}

impl Message for ChargeCreated {
    const MESSAGE_TYPE: &'static str = "payments.charge_created";
}

/// Emitted when (part of) an authorized charge is captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeCaptured {
    /// Captured amount in minor currency units.
    pub amount_minor: i64,
    /// Whether the capture was triggered by the auto-capture process.
    pub automatic: bool,
}

impl Message for ChargeCaptured {
    const MESSAGE_TYPE: &'static str = "payments.charge_captured";
}

/// Emitted when (part of) a captured charge is refunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRefunded {
    /// Refunded amount in minor currency units.
    pub amount_minor: i64,
    /// Why the refund was issued.
    pub reason: String,
}

impl Message for ChargeRefunded {
    const MESSAGE_TYPE: &'static str = "payments.charge_refunded";
}

/// Event payload variants of the `Charge` aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeEvent {
    /// A charge has been authorized.
    Created(ChargeCreated),
    /// A charge has been captured.
    Captured(ChargeCaptured),
    /// A charge has been refunded.
    Refunded(ChargeRefunded),
}

impl EventKind for ChargeEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => ChargeCreated::MESSAGE_TYPE,
            Self::Captured(_) => ChargeCaptured::MESSAGE_TYPE,
            Self::Refunded(_) => ChargeRefunded::MESSAGE_TYPE,
        }
    }

    fn to_body(&self) -> Result<serde_json::Value, DomainError> {
        Ok(match self {
            Self::Created(e) => serde_json::to_value(e)?,
            Self::Captured(e) => serde_json::to_value(e)?,
            Self::Refunded(e) => serde_json::to_value(e)?,
        })
    }

    fn from_body(event_type: &str, body: serde_json::Value) -> Result<Self, DomainError> {
        match event_type {
            ChargeCreated::MESSAGE_TYPE => Ok(Self::Created(serde_json::from_value(body)?)),
            ChargeCaptured::MESSAGE_TYPE => Ok(Self::Captured(serde_json::from_value(body)?)),
            ChargeRefunded::MESSAGE_TYPE => Ok(Self::Refunded(serde_json::from_value(body)?)),
            other => Err(unknown_event_type(crate::domain::aggregates::CHARGE, other)),
        }
    }
}

impl EventVariant<ChargeEvent> for ChargeCreated {
    fn extract(kind: &ChargeEvent) -> Option<&Self> {
        match kind {
            ChargeEvent::Created(e) => Some(e),
            _ => None,
        }
    }
}

impl EventVariant<ChargeEvent> for ChargeCaptured {
    fn extract(kind: &ChargeEvent) -> Option<&Self> {
        match kind {
            ChargeEvent::Captured(e) => Some(e),
            _ => None,
        }
    }
}

impl EventVariant<ChargeEvent> for ChargeRefunded {
    fn extract(kind: &ChargeEvent) -> Option<&Self> {
        match kind {
            ChargeEvent::Refunded(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_event_body_round_trips_through_discriminator() {
        // Arrange
        let event = ChargeEvent::Created(ChargeCreated {
            client_application_key: Uuid::new_v4(),
            amount_minor: 12_500,
            currency: "EUR".to_owned(),
            auto_capture_after_secs: Some(3600),
        });

        // Act
        let body = event.to_body().unwrap();
        let rebuilt = ChargeEvent::from_body(event.event_type(), body.clone()).unwrap();

        // Assert
        assert_eq!(rebuilt, event);
        assert_eq!(body["amount_minor"], 12_500);
    }

    #[test]
    fn test_unknown_discriminator_is_a_serialization_error() {
        let result =
            ClientApplicationEvent::from_body("payments.charge_created", serde_json::json!({}));

        assert!(matches!(result, Err(DomainError::Serialization(_))));
    }

    #[test]
    fn test_variants_extract_only_their_own_payload() {
        let renamed = ClientApplicationEvent::Renamed(ClientApplicationRenamed {
            name: "Checkout".to_owned(),
        });

        assert!(ClientApplicationRenamed::extract(&renamed).is_some());
        assert!(ClientApplicationCreated::extract(&renamed).is_none());
        assert!(ClientApplicationDeactivated::extract(&renamed).is_none());
    }
}
