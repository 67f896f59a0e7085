//! Payflow Core — event-sourcing and messaging abstractions.
//!
//! This crate defines the aggregate model, events, commands, bus and
//! subscription contracts, and the storage traits that the runtime and the
//! storage backends implement. It contains no infrastructure code.

pub mod aggregate;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod command;
pub mod error;
pub mod event;
pub mod key;
pub mod message;
pub mod notification;
pub mod storage;
pub mod subscription;
