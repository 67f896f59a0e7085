//! Shared test mocks and utilities for the Payflow workspace.
//!
//! Provides deterministic clocks, in-memory storage providers, recording and
//! failing buses, and a small snapshot-capable aggregate for tests.

mod bus;
mod clock;
mod snapshot;
mod store;
pub mod tally;

pub use bus::{FailingBus, RecordingBus};
pub use clock::{FixedClock, ManualClock};
pub use snapshot::InMemorySnapshotStore;
pub use store::InMemoryEventStore;
