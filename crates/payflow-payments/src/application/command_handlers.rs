//! Command handlers for the Payments context.
//!
//! Each handler validates the command, rejects resubmissions through the
//! repository's duplicate detection, loads the aggregate, runs the domain
//! method and saves the resulting events.

use std::sync::Arc;

use async_trait::async_trait;
use payflow_core::aggregate::Aggregate;
use payflow_core::bus::CommandHandler;
use payflow_core::command::Command;
use payflow_core::error::DomainError;
use payflow_core::key::new_key;
use payflow_runtime::repository::AggregateRepository;
use uuid::Uuid;

use crate::domain::aggregates::{Charge, ClientApplication};
use crate::domain::commands::{
    CaptureCharge, CreateCharge, CreateClientApplication, DeactivateClientApplication,
    RefundCharge, RenameClientApplication,
};

/// Result of a creation request from a synchronous caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The aggregate was created under this key.
    Created(Uuid),
    /// The command had already been processed; this is the original key.
    Existing(Uuid),
}

impl CreateOutcome {
    /// Key of the aggregate, whether new or existing.
    #[must_use]
    pub fn aggregate_key(self) -> Uuid {
        match self {
            Self::Created(key) | Self::Existing(key) => key,
        }
    }
}

fn into_outcome(result: Result<Uuid, DomainError>) -> Result<CreateOutcome, DomainError> {
    match result {
        Ok(key) => Ok(CreateOutcome::Created(key)),
        Err(DomainError::Duplicate {
            original_aggregate_key,
            ..
        }) => Ok(CreateOutcome::Existing(original_aggregate_key)),
        Err(e) => Err(e),
    }
}

/// Validates the command and fails if it was already processed.
async fn admit<A: Aggregate, C: Command>(
    repo: &AggregateRepository<A>,
    command: &C,
) -> Result<(), DomainError> {
    command.validate().into_result()?;
    repo.ensure_not_duplicate(command.correlation_key(), command.application_key())
        .await
}

async fn load<A: Aggregate>(
    repo: &AggregateRepository<A>,
    aggregate_key: Uuid,
) -> Result<A, DomainError> {
    repo.get_by_id(aggregate_key)
        .await?
        .ok_or(DomainError::AggregateNotFound(aggregate_key))
}

/// Handles `CreateClientApplication`: registers a new application under a
/// fresh key.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an invalid command,
/// `DomainError::Duplicate` if it was already processed, or storage errors.
pub async fn handle_create_client_application(
    applications: &AggregateRepository<ClientApplication>,
    command: &CreateClientApplication,
) -> Result<Uuid, DomainError> {
    admit(applications, command).await?;

    let key = new_key();
    let mut application = applications.create();
    application.create(key, command)?;
    applications.save(&mut application).await?;

    tracing::info!(
        client_application_key = %key,
        correlation_key = %command.correlation_key,
        "client application created"
    );
    Ok(key)
}

/// Like [`handle_create_client_application`], but a resubmitted command
/// returns the key of the application it originally created.
///
/// # Errors
///
/// Every error of [`handle_create_client_application`] except
/// `DomainError::Duplicate`.
pub async fn create_client_application(
    applications: &AggregateRepository<ClientApplication>,
    command: &CreateClientApplication,
) -> Result<CreateOutcome, DomainError> {
    into_outcome(handle_create_client_application(applications, command).await)
}

/// Handles `CreateCharge`: authorizes a charge for an active application.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the application does not
/// exist, `DomainError::Validation` if the command is invalid or the
/// application is deactivated, `DomainError::Duplicate` if it was already
/// processed, or storage errors.
pub async fn handle_create_charge(
    charges: &AggregateRepository<Charge>,
    applications: &AggregateRepository<ClientApplication>,
    command: &CreateCharge,
) -> Result<Uuid, DomainError> {
    admit(charges, command).await?;
    load(applications, command.client_application_key)
        .await?
        .active_key()?;

    let key = new_key();
    let mut charge = charges.create();
    charge.create(key, command)?;
    charges.save(&mut charge).await?;

    tracing::info!(
        charge_key = %key,
        client_application_key = %command.client_application_key,
        amount_minor = command.amount_minor,
        currency = %command.currency,
        "charge created"
    );
    Ok(key)
}

/// Like [`handle_create_charge`], but a resubmitted command returns the key
/// of the charge it originally created.
///
/// # Errors
///
/// Every error of [`handle_create_charge`] except `DomainError::Duplicate`.
pub async fn create_charge(
    charges: &AggregateRepository<Charge>,
    applications: &AggregateRepository<ClientApplication>,
    command: &CreateCharge,
) -> Result<CreateOutcome, DomainError> {
    into_outcome(handle_create_charge(charges, applications, command).await)
}

/// Bus handler for the client application commands.
pub struct ClientApplicationCommandHandler {
    applications: Arc<AggregateRepository<ClientApplication>>,
}

impl ClientApplicationCommandHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(applications: Arc<AggregateRepository<ClientApplication>>) -> Self {
        Self { applications }
    }
}

#[async_trait]
impl CommandHandler<CreateClientApplication> for ClientApplicationCommandHandler {
    async fn handle(&self, command: CreateClientApplication) -> Result<(), DomainError> {
        handle_create_client_application(&self.applications, &command)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CommandHandler<RenameClientApplication> for ClientApplicationCommandHandler {
    async fn handle(&self, command: RenameClientApplication) -> Result<(), DomainError> {
        admit(&self.applications, &command).await?;
        let mut application = load(&self.applications, command.client_application_key).await?;
        application.rename(&command)?;
        self.applications.save(&mut application).await
    }
}

#[async_trait]
impl CommandHandler<DeactivateClientApplication> for ClientApplicationCommandHandler {
    async fn handle(&self, command: DeactivateClientApplication) -> Result<(), DomainError> {
        admit(&self.applications, &command).await?;
        let mut application = load(&self.applications, command.client_application_key).await?;
        application.deactivate(&command)?;
        self.applications.save(&mut application).await?;
        tracing::info!(
            client_application_key = %command.client_application_key,
            reason = %command.reason,
            "client application deactivated"
        );
        Ok(())
    }
}

/// Bus handler for the charge commands.
pub struct ChargeCommandHandler {
    charges: Arc<AggregateRepository<Charge>>,
    applications: Arc<AggregateRepository<ClientApplication>>,
}

impl ChargeCommandHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(
        charges: Arc<AggregateRepository<Charge>>,
        applications: Arc<AggregateRepository<ClientApplication>>,
    ) -> Self {
        Self {
            charges,
            applications,
        }
    }
}

#[async_trait]
impl CommandHandler<CreateCharge> for ChargeCommandHandler {
    async fn handle(&self, command: CreateCharge) -> Result<(), DomainError> {
        handle_create_charge(&self.charges, &self.applications, &command)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CommandHandler<CaptureCharge> for ChargeCommandHandler {
    async fn handle(&self, command: CaptureCharge) -> Result<(), DomainError> {
        admit(&self.charges, &command).await?;
        let mut charge = load(&self.charges, command.charge_key).await?;
        if command.automatic && charge.is_captured() {
            tracing::info!(
                charge_key = %command.charge_key,
                "charge already captured; auto-capture skipped"
            );
            return Ok(());
        }
        charge.capture(&command)?;
        self.charges.save(&mut charge).await?;
        tracing::info!(
            charge_key = %command.charge_key,
            amount_minor = charge.captured_minor(),
            automatic = command.automatic,
            "charge captured"
        );
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<RefundCharge> for ChargeCommandHandler {
    async fn handle(&self, command: RefundCharge) -> Result<(), DomainError> {
        admit(&self.charges, &command).await?;
        let mut charge = load(&self.charges, command.charge_key).await?;
        charge.refund(&command)?;
        self.charges.save(&mut charge).await?;
        tracing::info!(
            charge_key = %command.charge_key,
            amount_minor = command.amount_minor,
            "charge refunded"
        );
        Ok(())
    }
}
