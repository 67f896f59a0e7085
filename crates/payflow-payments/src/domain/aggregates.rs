//! Aggregate roots for the Payments context.

use std::sync::Arc;

use payflow_core::aggregate::{Aggregate, ApplyRegistry, ApplyRegistryBuilder, EventStream};
use payflow_core::error::DomainError;
use payflow_core::event::{Event, EventMetadata};
use payflow_core::notification::Notification;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::commands::{
    CaptureCharge, CreateCharge, CreateClientApplication, DeactivateClientApplication,
    RefundCharge, RenameClientApplication,
};
use crate::domain::events::{
    ChargeCaptured, ChargeCreated, ChargeEvent, ChargeRefunded, ClientApplicationCreated,
    ClientApplicationDeactivated, ClientApplicationEvent, ClientApplicationRenamed,
};

/// Aggregate type name of [`ClientApplication`].
pub const CLIENT_APPLICATION: &str = "payments.client_application";

/// Aggregate type name of [`Charge`].
pub const CHARGE: &str = "payments.charge";

/// A business rule rejected the command.
fn rule_violation(field: &str, message: &str) -> DomainError {
    let mut notification = Notification::new();
    notification.add(field, message);
    DomainError::Validation(notification)
}

fn not_created(aggregate_type: &str) -> DomainError {
    DomainError::Configuration(format!("{aggregate_type} has not been created"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ClientApplicationState {
    name: String,
    contact_email: String,
    active: bool,
}

/// A merchant integration allowed to create charges.
#[derive(Debug)]
pub struct ClientApplication {
    state: ClientApplicationState,
    stream: EventStream<Self>,
}

impl ClientApplication {
    /// Registers the application under `key`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateCreation` if this instance already
    /// holds a stream.
    pub fn create(
        &mut self,
        key: Uuid,
        command: &CreateClientApplication,
    ) -> Result<(), DomainError> {
        if let Some(aggregate_key) = self.aggregate_key() {
            return Err(DomainError::AggregateCreation { aggregate_key });
        }
        self.apply_new(Event::new(
            EventMetadata::new(key, command.application_key, command.correlation_key),
            ClientApplicationEvent::Created(ClientApplicationCreated {
                name: command.name.trim().to_owned(),
                contact_email: command.contact_email.trim().to_owned(),
            }),
        ))
    }

    /// Changes the display name. Renaming to the current name raises nothing.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the application is deactivated.
    pub fn rename(&mut self, command: &RenameClientApplication) -> Result<(), DomainError> {
        let key = self.active_key()?;
        let name = command.name.trim();
        if name == self.state.name {
            return Ok(());
        }
        self.apply_new(Event::new(
            EventMetadata::new(key, command.application_key, command.correlation_key),
            ClientApplicationEvent::Renamed(ClientApplicationRenamed {
                name: name.to_owned(),
            }),
        ))
    }

    /// Deactivates the application. Deactivating twice raises nothing.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if the application was never
    /// created.
    pub fn deactivate(&mut self, command: &DeactivateClientApplication) -> Result<(), DomainError> {
        let key = self
            .aggregate_key()
            .ok_or_else(|| not_created(CLIENT_APPLICATION))?;
        if !self.state.active {
            return Ok(());
        }
        self.apply_new(Event::new(
            EventMetadata::new(key, command.application_key, command.correlation_key),
            ClientApplicationEvent::Deactivated(ClientApplicationDeactivated {
                reason: command.reason.trim().to_owned(),
            }),
        ))
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Contact address.
    #[must_use]
    pub fn contact_email(&self) -> &str {
        &self.state.contact_email
    }

    /// Whether the application may still create charges.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Key of the application, if it is active.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if it is deactivated, or
    /// `DomainError::Configuration` if it was never created.
    pub fn active_key(&self) -> Result<Uuid, DomainError> {
        let key = self
            .aggregate_key()
            .ok_or_else(|| not_created(CLIENT_APPLICATION))?;
        if !self.state.active {
            return Err(rule_violation(
                "client_application_key",
                "client application is deactivated",
            ));
        }
        Ok(key)
    }
}

impl Aggregate for ClientApplication {
    type Kind = ClientApplicationEvent;
    const AGGREGATE_TYPE: &'static str = CLIENT_APPLICATION;
    const SUPPORTS_SNAPSHOTS: bool = true;

    fn new(registry: Arc<ApplyRegistry<Self>>) -> Self {
        Self {
            state: ClientApplicationState::default(),
            stream: EventStream::new(registry),
        }
    }

    fn register_handlers(
        registry: ApplyRegistryBuilder<Self>,
    ) -> Result<ApplyRegistryBuilder<Self>, DomainError> {
        registry
            .on(|app: &mut Self, e: &ClientApplicationCreated| {
                app.state = ClientApplicationState {
                    name: e.name.clone(),
                    contact_email: e.contact_email.clone(),
                    active: true,
                };
            })?
            .on(|app: &mut Self, e: &ClientApplicationRenamed| app.state.name.clone_from(&e.name))?
            .on(|app: &mut Self, _: &ClientApplicationDeactivated| app.state.active = false)
    }

    fn stream(&self) -> &EventStream<Self> {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut EventStream<Self> {
        &mut self.stream
    }

    fn snapshot_state(&self) -> Result<serde_json::Value, DomainError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore_state(&mut self, state: serde_json::Value) -> Result<(), DomainError> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ChargeState {
    client_application_key: Uuid,
    amount_minor: i64,
    currency: String,
    captured_minor: i64,
    refunded_minor: i64,
    auto_capture_after_secs: Option<u32>,
}

/// An authorization against a client application, captured and refunded in
/// minor currency units.
#[derive(Debug)]
pub struct Charge {
    state: ChargeState,
    stream: EventStream<Self>,
}

impl Charge {
    /// Authorizes the charge under `key`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateCreation` if this instance already
    /// holds a stream.
    pub fn create(&mut self, key: Uuid, command: &CreateCharge) -> Result<(), DomainError> {
        if let Some(aggregate_key) = self.aggregate_key() {
            return Err(DomainError::AggregateCreation { aggregate_key });
        }
        self.apply_new(Event::new(
            EventMetadata::new(key, command.application_key, command.correlation_key),
            ChargeEvent::Created(ChargeCreated {
                client_application_key: command.client_application_key,
                amount_minor: command.amount_minor,
                currency: command.currency.clone(),
                auto_capture_after_secs: command.auto_capture_after_secs,
            }),
        ))
    }

    /// Captures the charge, the whole authorization unless an amount is given.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the charge was already captured or
    /// the amount exceeds the authorization.
    pub fn capture(&mut self, command: &CaptureCharge) -> Result<(), DomainError> {
        let key = self.aggregate_key().ok_or_else(|| not_created(CHARGE))?;
        if self.is_captured() {
            return Err(rule_violation("charge_key", "charge has already been captured"));
        }
        let amount_minor = command.amount_minor.unwrap_or(self.state.amount_minor);
        if amount_minor > self.state.amount_minor {
            return Err(rule_violation(
                "amount_minor",
                "exceeds the authorized amount",
            ));
        }
        self.apply_new(Event::new(
            EventMetadata::new(key, command.application_key, command.correlation_key),
            ChargeEvent::Captured(ChargeCaptured {
                amount_minor,
                automatic: command.automatic,
            }),
        ))
    }

    /// Refunds part or all of the captured amount.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if nothing was captured or the amount
    /// exceeds what is left to refund.
    pub fn refund(&mut self, command: &RefundCharge) -> Result<(), DomainError> {
        let key = self.aggregate_key().ok_or_else(|| not_created(CHARGE))?;
        if !self.is_captured() {
            return Err(rule_violation("charge_key", "charge has not been captured"));
        }
        if command.amount_minor > self.refundable_minor() {
            return Err(rule_violation(
                "amount_minor",
                "exceeds the refundable amount",
            ));
        }
        self.apply_new(Event::new(
            EventMetadata::new(key, command.application_key, command.correlation_key),
            ChargeEvent::Refunded(ChargeRefunded {
                amount_minor: command.amount_minor,
                reason: command.reason.trim().to_owned(),
            }),
        ))
    }

    /// The client application that owns the charge.
    #[must_use]
    pub fn client_application_key(&self) -> Uuid {
        self.state.client_application_key
    }

    /// Authorized amount.
    #[must_use]
    pub fn amount_minor(&self) -> i64 {
        self.state.amount_minor
    }

    /// Currency code.
    #[must_use]
    pub fn currency(&self) -> &str {
        &self.state.currency
    }

    /// Captured amount.
    #[must_use]
    pub fn captured_minor(&self) -> i64 {
        self.state.captured_minor
    }

    /// Refunded amount.
    #[must_use]
    pub fn refunded_minor(&self) -> i64 {
        self.state.refunded_minor
    }

    /// Amount still available for refunds.
    #[must_use]
    pub fn refundable_minor(&self) -> i64 {
        self.state.captured_minor - self.state.refunded_minor
    }

    /// Whether a capture has been recorded.
    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.state.captured_minor > 0
    }

    /// Auto-capture delay requested at creation.
    #[must_use]
    pub fn auto_capture_after_secs(&self) -> Option<u32> {
        self.state.auto_capture_after_secs
    }
}

impl Aggregate for Charge {
    type Kind = ChargeEvent;
    const AGGREGATE_TYPE: &'static str = CHARGE;

    fn new(registry: Arc<ApplyRegistry<Self>>) -> Self {
        Self {
            state: ChargeState::default(),
            stream: EventStream::new(registry),
        }
    }

    fn register_handlers(
        registry: ApplyRegistryBuilder<Self>,
    ) -> Result<ApplyRegistryBuilder<Self>, DomainError> {
        registry
            .on(|charge: &mut Self, e: &ChargeCreated| {
                charge.state = ChargeState {
                    client_application_key: e.client_application_key,
                    amount_minor: e.amount_minor,
                    currency: e.currency.clone(),
                    auto_capture_after_secs: e.auto_capture_after_secs,
                    ..ChargeState::default()
                };
            })?
            .on(|charge: &mut Self, e: &ChargeCaptured| {
                charge.state.captured_minor = e.amount_minor;
            })?
            .on(|charge: &mut Self, e: &ChargeRefunded| {
                charge.state.refunded_minor += e.amount_minor;
            })
    }

    fn stream(&self) -> &EventStream<Self> {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut EventStream<Self> {
        &mut self.stream
    }
}
