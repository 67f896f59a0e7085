//! End-to-end tests of the Payments context over in-memory storage.

mod common;

use payflow_core::aggregate::Aggregate;
use payflow_core::bus::{MessageBus, send};
use payflow_core::error::DomainError;
use payflow_core::message::Message;
use payflow_payments::application::command_handlers::{
    CreateOutcome, create_charge, create_client_application,
};
use payflow_payments::domain::commands::{
    CaptureCharge, DeactivateClientApplication, RefundCharge, RenameClientApplication,
};
use payflow_payments::domain::events::{ChargeCaptured, ChargeCreated};
use uuid::Uuid;

use common::APPLICATION_KEY;

#[tokio::test]
async fn test_resubmitted_create_is_reported_as_duplicate() {
    // Arrange
    let (stack, store, _) = common::in_memory_stack();
    let command = common::create_application(Uuid::from_u128(0xC1), "Storefront");

    // Act
    let first = create_client_application(&stack.applications, &command)
        .await
        .unwrap();
    let via_bus = send(stack.bus.as_ref(), &command).await;
    let second = create_client_application(&stack.applications, &command)
        .await
        .unwrap();

    // Assert
    let CreateOutcome::Created(original) = first else {
        panic!("expected a new application, got {first:?}");
    };
    assert!(matches!(
        via_bus,
        Err(DomainError::Duplicate { original_aggregate_key, .. })
            if original_aggregate_key == original
    ));
    assert_eq!(second, CreateOutcome::Existing(original));
    assert_eq!(store.all_events().len(), 1);
}

#[tokio::test]
async fn test_outbox_publisher_feeds_the_directory() {
    // Arrange
    let (stack, store, _) = common::in_memory_stack();
    let key = create_client_application(
        &stack.applications,
        &common::create_application(Uuid::new_v4(), "Storefront"),
    )
    .await
    .unwrap()
    .aggregate_key();
    send(
        stack.bus.as_ref(),
        &RenameClientApplication {
            correlation_key: Uuid::new_v4(),
            application_key: APPLICATION_KEY,
            client_application_key: key,
            name: "Checkout".to_owned(),
        },
    )
    .await
    .unwrap();
    assert!(stack.directory.is_empty());

    // Act
    let report = stack.publisher.run().await.unwrap();

    // Assert
    assert_eq!(report.dispatched, 2);
    assert!(store.pending_keys().is_empty());
    let row = stack.directory.get(key).unwrap();
    assert_eq!(row.name, "Checkout");
    assert_eq!(row.version, 1);
    assert_eq!(stack.directory.active().len(), 1);
}

#[tokio::test]
async fn test_redelivered_events_leave_the_directory_unchanged() {
    let (stack, store, _) = common::in_memory_stack();
    let key = create_client_application(
        &stack.applications,
        &common::create_application(Uuid::new_v4(), "Storefront"),
    )
    .await
    .unwrap()
    .aggregate_key();
    send(
        stack.bus.as_ref(),
        &DeactivateClientApplication {
            correlation_key: Uuid::new_v4(),
            application_key: APPLICATION_KEY,
            client_application_key: key,
            reason: "merchant closed".to_owned(),
        },
    )
    .await
    .unwrap();
    stack.publisher.run().await.unwrap();

    for event in store.all_events() {
        stack.bus.raise_event(event.to_message()).await.unwrap();
    }

    let row = stack.directory.get(key).unwrap();
    assert!(!row.active);
    assert_eq!(row.version, 1);
    assert!(stack.directory.active().is_empty());
}

#[tokio::test]
async fn test_deactivated_application_cannot_be_charged() {
    let (stack, _, _) = common::in_memory_stack();
    let key = create_client_application(
        &stack.applications,
        &common::create_application(Uuid::new_v4(), "Storefront"),
    )
    .await
    .unwrap()
    .aggregate_key();
    send(
        stack.bus.as_ref(),
        &DeactivateClientApplication {
            correlation_key: Uuid::new_v4(),
            application_key: APPLICATION_KEY,
            client_application_key: key,
            reason: "chargeback ratio".to_owned(),
        },
    )
    .await
    .unwrap();

    let result = send(stack.bus.as_ref(), &common::create_charge(key, 1_000, None)).await;

    assert!(matches!(result, Err(DomainError::Validation(_))));
}

#[tokio::test]
async fn test_charge_is_captured_and_refunded_over_the_bus() {
    // Arrange
    let (stack, _, _) = common::in_memory_stack();
    let app_key = create_client_application(
        &stack.applications,
        &common::create_application(Uuid::new_v4(), "Storefront"),
    )
    .await
    .unwrap()
    .aggregate_key();
    let charge_key = create_charge(
        &stack.charges,
        &stack.applications,
        &common::create_charge(app_key, 5_000, None),
    )
    .await
    .unwrap()
    .aggregate_key();

    // Act
    send(
        stack.bus.as_ref(),
        &CaptureCharge {
            correlation_key: Uuid::new_v4(),
            application_key: APPLICATION_KEY,
            charge_key,
            amount_minor: Some(4_000),
            automatic: false,
        },
    )
    .await
    .unwrap();
    let over_refund = send(
        stack.bus.as_ref(),
        &RefundCharge {
            correlation_key: Uuid::new_v4(),
            application_key: APPLICATION_KEY,
            charge_key,
            amount_minor: 4_001,
            reason: "goodwill".to_owned(),
        },
    )
    .await;
    send(
        stack.bus.as_ref(),
        &RefundCharge {
            correlation_key: Uuid::new_v4(),
            application_key: APPLICATION_KEY,
            charge_key,
            amount_minor: 4_000,
            reason: "returned".to_owned(),
        },
    )
    .await
    .unwrap();

    // Assert
    assert!(matches!(over_refund, Err(DomainError::Validation(_))));
    let charge = stack.charges.get_by_id(charge_key).await.unwrap().unwrap();
    assert_eq!(charge.captured_minor(), 4_000);
    assert_eq!(charge.refundable_minor(), 0);
    assert_eq!(charge.current_version(), 2);
}

#[tokio::test]
async fn test_auto_capture_runs_once_despite_redelivery() {
    // Arrange
    let (stack, store, _) = common::in_memory_stack();
    let app_key = create_client_application(
        &stack.applications,
        &common::create_application(Uuid::new_v4(), "Storefront"),
    )
    .await
    .unwrap()
    .aggregate_key();
    let charge_key = create_charge(
        &stack.charges,
        &stack.applications,
        &common::create_charge(app_key, 7_500, Some(0)),
    )
    .await
    .unwrap()
    .aggregate_key();

    // Act
    stack.publisher.run().await.unwrap();
    stack.runner.wait_idle().await;
    let created = store
        .all_events()
        .into_iter()
        .find(|e| e.event_type == ChargeCreated::MESSAGE_TYPE)
        .unwrap();
    stack.bus.raise_event(created.to_message()).await.unwrap();
    stack.runner.wait_idle().await;

    // Assert
    let charge = stack.charges.get_by_id(charge_key).await.unwrap().unwrap();
    assert!(charge.is_captured());
    assert_eq!(charge.captured_minor(), 7_500);
    let captures: Vec<_> = store
        .all_events()
        .into_iter()
        .filter(|e| e.event_type == ChargeCaptured::MESSAGE_TYPE)
        .collect();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].metadata.correlation_key, created.metadata.event_key);
    assert_eq!(captures[0].body["automatic"], true);
}

#[tokio::test]
async fn test_renamed_application_is_snapshotted_and_reloads() {
    // Arrange
    let (stack, _, snapshots) = common::in_memory_stack();
    let key = create_client_application(
        &stack.applications,
        &common::create_application(Uuid::new_v4(), "Name 0"),
    )
    .await
    .unwrap()
    .aggregate_key();

    // Act
    for i in 1..=12 {
        send(
            stack.bus.as_ref(),
            &RenameClientApplication {
                correlation_key: Uuid::new_v4(),
                application_key: APPLICATION_KEY,
                client_application_key: key,
                name: format!("Name {i}"),
            },
        )
        .await
        .unwrap();
    }

    // Assert
    let saved = snapshots.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].version, 10);
    let reloaded = stack.applications.get_by_id(key).await.unwrap().unwrap();
    assert_eq!(reloaded.name(), "Name 12");
    assert_eq!(reloaded.current_version(), 12);
}
