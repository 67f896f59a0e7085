//! Application layer: command handlers, subscribers and their wiring.

pub mod command_handlers;
pub mod event_handlers;

use std::sync::Arc;

use payflow_core::error::DomainError;
use payflow_runtime::dispatcher::MessageDispatcher;
use payflow_runtime::repository::AggregateRepository;
use payflow_runtime::scheduler::CommandScheduler;

use crate::domain::aggregates::{Charge, ClientApplication};
use crate::domain::commands::{
    CaptureCharge, CreateCharge, CreateClientApplication, DeactivateClientApplication,
    RefundCharge, RenameClientApplication,
};
use crate::domain::events::{
    ChargeCreated, ClientApplicationCreated, ClientApplicationDeactivated,
    ClientApplicationRenamed,
};
use command_handlers::{ChargeCommandHandler, ClientApplicationCommandHandler};
use event_handlers::{AutoCaptureProcess, ClientApplicationDirectory};

/// Register every Payments handler and subscriber on `dispatcher`.
///
/// Returns the directory read model so callers can query it.
///
/// # Errors
///
/// Returns `DomainError::Configuration` if a command type already has a
/// handler or a subscriber is registered twice.
pub fn register_handlers(
    dispatcher: &MessageDispatcher,
    applications: Arc<AggregateRepository<ClientApplication>>,
    charges: Arc<AggregateRepository<Charge>>,
    scheduler: Arc<CommandScheduler>,
) -> Result<Arc<ClientApplicationDirectory>, DomainError> {
    let application_commands = Arc::new(ClientApplicationCommandHandler::new(Arc::clone(
        &applications,
    )));
    dispatcher.register_command::<CreateClientApplication, _>(Arc::clone(&application_commands))?;
    dispatcher.register_command::<RenameClientApplication, _>(Arc::clone(&application_commands))?;
    dispatcher.register_command::<DeactivateClientApplication, _>(application_commands)?;

    let charge_commands = Arc::new(ChargeCommandHandler::new(charges, applications));
    dispatcher.register_command::<CreateCharge, _>(Arc::clone(&charge_commands))?;
    dispatcher.register_command::<CaptureCharge, _>(Arc::clone(&charge_commands))?;
    dispatcher.register_command::<RefundCharge, _>(charge_commands)?;

    let directory = Arc::new(ClientApplicationDirectory::new());
    dispatcher.subscribe::<ClientApplicationCreated, _>(Arc::clone(&directory))?;
    dispatcher.subscribe::<ClientApplicationRenamed, _>(Arc::clone(&directory))?;
    dispatcher.subscribe::<ClientApplicationDeactivated, _>(Arc::clone(&directory))?;
    dispatcher.subscribe::<ChargeCreated, _>(Arc::new(AutoCaptureProcess::new(scheduler)))?;

    tracing::info!(
        commands = dispatcher.command_types().len(),
        "payments handlers registered"
    );
    Ok(directory)
}
