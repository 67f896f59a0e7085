//! Payflow Runtime — the moving parts around the core abstractions.
//!
//! Provides the aggregate repository with snapshot cadence, the message
//! dispatcher and in-process bus, the broker transport seam with its consumer,
//! the outbox publisher, and the background command scheduler.

pub mod dispatcher;
pub mod in_process_bus;
pub mod memory_transport;
pub mod publisher;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod transport;
