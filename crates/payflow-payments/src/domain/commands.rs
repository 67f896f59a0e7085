//! Commands for the Payments context.
//!
//! Every command carries the `(correlation_key, application_key)` pair that
//! identifies one submission; resubmitting the same pair is detected as a
//! duplicate.

use payflow_core::command::Command;
use payflow_core::message::Message;
use payflow_core::notification::Notification;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted client application name.
pub const MAX_NAME_LEN: usize = 100;

fn check_name(notification: &mut Notification, name: &str) {
    notification.require(!name.trim().is_empty(), "name", "must not be empty");
    notification.require(
        name.chars().count() <= MAX_NAME_LEN,
        "name",
        "must be at most 100 characters",
    );
}

fn check_keys(notification: &mut Notification, correlation_key: Uuid, application_key: Uuid) {
    notification.require(!correlation_key.is_nil(), "correlation_key", "is required");
    notification.require(!application_key.is_nil(), "application_key", "is required");
}

/// Command to register a client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClientApplication {
    /// Correlation key of this submission.
    pub correlation_key: Uuid,
    /// The application submitting the command.
    pub application_key: Uuid,
    /// Display name.
    pub name: String,
    /// Address notified about account activity.
    pub contact_email: String,
}

impl Message for CreateClientApplication {
    const MESSAGE_TYPE: &'static str = "payments.create_client_application";
}

impl Command for CreateClientApplication {
    fn correlation_key(&self) -> Uuid {
        self.correlation_key
    }

    fn application_key(&self) -> Uuid {
        self.application_key
    }

    fn validate(&self) -> Notification {
        let mut notification = Notification::new();
        check_keys(&mut notification, self.correlation_key, self.application_key);
        check_name(&mut notification, &self.name);
        let email = self.contact_email.trim();
        notification.require(
            email.split_once('@').is_some_and(|(user, host)| {
                !user.is_empty() && host.contains('.') && !host.starts_with('.')
            }),
            "contact_email",
            "must be an email address",
        );
        notification
    }
}

/// Command to rename a client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameClientApplication {
    /// Correlation key of this submission.
    pub correlation_key: Uuid,
    /// The application submitting the command.
    pub application_key: Uuid,
    /// The client application to rename.
    pub client_application_key: Uuid,
    /// The new display name.
    pub name: String,
}

impl Message for RenameClientApplication {
    const MESSAGE_TYPE: &'static str = "payments.rename_client_application";
}

impl Command for RenameClientApplication {
    fn correlation_key(&self) -> Uuid {
        self.correlation_key
    }

    fn application_key(&self) -> Uuid {
        self.application_key
    }

    fn validate(&self) -> Notification {
        let mut notification = Notification::new();
        check_keys(&mut notification, self.correlation_key, self.application_key);
        check_name(&mut notification, &self.name);
        notification
    }
}

/// Command to deactivate a client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateClientApplication {
    /// Correlation key of this submission.
    pub correlation_key: Uuid,
    /// The application submitting the command.
    pub application_key: Uuid,
    /// The client application to deactivate.
    pub client_application_key: Uuid,
    /// Why it is being deactivated.
    pub reason: String,
}

impl Message for DeactivateClientApplication {
    const MESSAGE_TYPE: &'static str = "payments.deactivate_client_application";
}

impl Command for DeactivateClientApplication {
    fn correlation_key(&self) -> Uuid {
        self.correlation_key
    }

    fn application_key(&self) -> Uuid {
        self.application_key
    }

    fn validate(&self) -> Notification {
        let mut notification = Notification::new();
        check_keys(&mut notification, self.correlation_key, self.application_key);
        notification.require(!self.reason.trim().is_empty(), "reason", "must not be empty");
        notification
    }
}

/// Command to authorize a charge for a client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCharge {
    /// Correlation key of this submission.
    pub correlation_key: Uuid,
    /// The application submitting the command.
    pub application_key: Uuid,
    /// The client application being charged.
    pub client_application_key: Uuid,
    /// Amount in minor currency units.
    pub amount_minor: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Capture automatically this many seconds after creation.
    pub auto_capture_after_secs: Option<u32>,
}

impl Message for CreateCharge {
    const MESSAGE_TYPE: &'static str = "payments.create_charge";
}

impl Command for CreateCharge {
    fn correlation_key(&self) -> Uuid {
        self.correlation_key
    }

    fn application_key(&self) -> Uuid {
        self.application_key
    }

    fn validate(&self) -> Notification {
        let mut notification = Notification::new();
        check_keys(&mut notification, self.correlation_key, self.application_key);
        notification.require(
            !self.client_application_key.is_nil(),
            "client_application_key",
            "is required",
        );
        notification.require(self.amount_minor > 0, "amount_minor", "must be positive");
        notification.require(
            self.currency.len() == 3 && self.currency.chars().all(|c| c.is_ascii_uppercase()),
            "currency",
            "must be a three-letter ISO 4217 code",
        );
        notification
    }
}

/// Command to capture an authorized charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureCharge {
    /// Correlation key of this submission.
    pub correlation_key: Uuid,
    /// The application submitting the command.
    pub application_key: Uuid,
    /// The charge to capture.
    pub charge_key: Uuid,
    /// Amount to capture; the whole authorization when `None`.
    pub amount_minor: Option<i64>,
    /// Sent by the auto-capture process rather than a caller.
    pub automatic: bool,
}

impl Message for CaptureCharge {
    const MESSAGE_TYPE: &'static str = "payments.capture_charge";
}

impl Command for CaptureCharge {
    fn correlation_key(&self) -> Uuid {
        self.correlation_key
    }

    fn application_key(&self) -> Uuid {
        self.application_key
    }

    fn validate(&self) -> Notification {
        let mut notification = Notification::new();
        check_keys(&mut notification, self.correlation_key, self.application_key);
        notification.require(!self.charge_key.is_nil(), "charge_key", "is required");
        notification.require(
            self.amount_minor.is_none_or(|amount| amount > 0),
            "amount_minor",
            "must be positive",
        );
        notification
    }
}

/// Command to refund (part of) a captured charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCharge {
    /// Correlation key of this submission.
    pub correlation_key: Uuid,
    /// The application submitting the command.
    pub application_key: Uuid,
    /// The charge to refund.
    pub charge_key: Uuid,
    /// Amount to refund in minor currency units.
    pub amount_minor: i64,
    /// Why the refund is issued.
    pub reason: String,
}

impl Message for RefundCharge {
    const MESSAGE_TYPE: &'static str = "payments.refund_charge";
}

impl Command for RefundCharge {
    fn correlation_key(&self) -> Uuid {
        self.correlation_key
    }

    fn application_key(&self) -> Uuid {
        self.application_key
    }

    fn validate(&self) -> Notification {
        let mut notification = Notification::new();
        check_keys(&mut notification, self.correlation_key, self.application_key);
        notification.require(!self.charge_key.is_nil(), "charge_key", "is required");
        notification.require(self.amount_minor > 0, "amount_minor", "must be positive");
        notification.require(!self.reason.trim().is_empty(), "reason", "must not be empty");
        notification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_application(name: &str, contact_email: &str) -> CreateClientApplication {
        CreateClientApplication {
            correlation_key: Uuid::new_v4(),
            application_key: Uuid::new_v4(),
            name: name.to_owned(),
            contact_email: contact_email.to_owned(),
        }
    }

    fn failed_fields(notification: &Notification) -> Vec<&str> {
        notification
            .failures()
            .iter()
            .map(|f| f.field.as_str())
            .collect()
    }

    #[test]
    fn test_valid_create_client_application_has_no_failures() {
        let command = create_application("Storefront", "ops@storefront.example");

        assert!(!command.validate().has_errors());
    }

    #[test]
    fn test_create_client_application_collects_every_failure() {
        // Arrange
        let mut command = create_application("   ", "not-an-email");
        command.correlation_key = Uuid::nil();

        // Act
        let notification = command.validate();

        // Assert
        assert_eq!(
            failed_fields(&notification),
            vec!["correlation_key", "name", "contact_email"]
        );
    }

    #[test]
    fn test_overlong_name_is_rejected() {
        let command = create_application(&"x".repeat(MAX_NAME_LEN + 1), "a@b.example");

        assert_eq!(failed_fields(&command.validate()), vec!["name"]);
    }

    #[test]
    fn test_create_charge_checks_amount_and_currency() {
        let command = CreateCharge {
            correlation_key: Uuid::new_v4(),
            application_key: Uuid::new_v4(),
            client_application_key: Uuid::new_v4(),
            amount_minor: 0,
            currency: "eur".to_owned(),
            auto_capture_after_secs: None,
        };

        assert_eq!(
            failed_fields(&command.validate()),
            vec!["amount_minor", "currency"]
        );
    }

    #[test]
    fn test_capture_amount_is_optional_but_positive() {
        let mut command = CaptureCharge {
            correlation_key: Uuid::new_v4(),
            application_key: Uuid::new_v4(),
            charge_key: Uuid::new_v4(),
            amount_minor: None,
            automatic: false,
        };
        assert!(!command.validate().has_errors());

        command.amount_minor = Some(-5);

        assert_eq!(failed_fields(&command.validate()), vec!["amount_minor"]);
    }
}
