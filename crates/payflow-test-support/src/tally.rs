//! Test aggregate — a snapshot-capable running total.

use std::sync::Arc;

use payflow_core::aggregate::{Aggregate, ApplyRegistry, ApplyRegistryBuilder, EventStream};
use payflow_core::error::DomainError;
use payflow_core::event::{Event, EventKind, EventMetadata, EventVariant, unknown_event_type};
use payflow_core::message::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tally was opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyOpened {
    /// Display label.
    pub label: String,
}

impl Message for TallyOpened {
    const MESSAGE_TYPE: &'static str = "test.tally_opened";
}

/// An amount was added to a tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyAdded {
    /// Amount added.
    pub amount: i64,
}

impl Message for TallyAdded {
    const MESSAGE_TYPE: &'static str = "test.tally_added";
}

/// Events of the [`Tally`] aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum TallyEvent {
    /// See [`TallyOpened`].
    Opened(TallyOpened),
    /// See [`TallyAdded`].
    Added(TallyAdded),
}

impl EventKind for TallyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened(_) => TallyOpened::MESSAGE_TYPE,
            Self::Added(_) => TallyAdded::MESSAGE_TYPE,
        }
    }

    fn to_body(&self) -> Result<serde_json::Value, DomainError> {
        Ok(match self {
            Self::Opened(e) => serde_json::to_value(e)?,
            Self::Added(e) => serde_json::to_value(e)?,
        })
    }

    fn from_body(event_type: &str, body: serde_json::Value) -> Result<Self, DomainError> {
        match event_type {
            TallyOpened::MESSAGE_TYPE => Ok(Self::Opened(serde_json::from_value(body)?)),
            TallyAdded::MESSAGE_TYPE => Ok(Self::Added(serde_json::from_value(body)?)),
            other => Err(unknown_event_type(Tally::AGGREGATE_TYPE, other)),
        }
    }
}

impl EventVariant<TallyEvent> for TallyOpened {
    fn extract(kind: &TallyEvent) -> Option<&Self> {
        match kind {
            TallyEvent::Opened(e) => Some(e),
            TallyEvent::Added(_) => None,
        }
    }
}

impl EventVariant<TallyEvent> for TallyAdded {
    fn extract(kind: &TallyEvent) -> Option<&Self> {
        match kind {
            TallyEvent::Added(e) => Some(e),
            TallyEvent::Opened(_) => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TallyState {
    label: String,
    total: i64,
}

/// A labelled running total. Every raised event gets a fresh correlation key
/// unless one is given.
#[derive(Debug)]
pub struct Tally {
    state: TallyState,
    stream: EventStream<Self>,
}

impl Tally {
    /// Application key stamped on every tally event.
    pub const APPLICATION_KEY: Uuid = Uuid::from_u128(0x0a11_ce00_0000_0000_0000_0000_0000_0001);

    /// Open a new tally under `key`.
    ///
    /// # Errors
    ///
    /// Propagates apply errors.
    pub fn open(&mut self, key: Uuid, label: &str) -> Result<(), DomainError> {
        self.open_correlated(key, label, Uuid::new_v4())
    }

    /// Open a new tally with an explicit correlation key.
    ///
    /// # Errors
    ///
    /// Propagates apply errors.
    pub fn open_correlated(
        &mut self,
        key: Uuid,
        label: &str,
        correlation_key: Uuid,
    ) -> Result<(), DomainError> {
        let metadata = EventMetadata::new(key, Self::APPLICATION_KEY, correlation_key);
        self.apply_new(Event::new(
            metadata,
            TallyEvent::Opened(TallyOpened {
                label: label.to_owned(),
            }),
        ))
    }

    /// Add `amount` to the tally.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if the tally was never opened.
    pub fn add(&mut self, amount: i64) -> Result<(), DomainError> {
        let key = self
            .aggregate_key()
            .ok_or_else(|| DomainError::Configuration("tally has not been opened".into()))?;
        let metadata = EventMetadata::new(key, Self::APPLICATION_KEY, Uuid::new_v4());
        self.apply_new(Event::new(metadata, TallyEvent::Added(TallyAdded { amount })))
    }

    /// Current label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Current total.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.state.total
    }
}

impl Aggregate for Tally {
    type Kind = TallyEvent;
    const AGGREGATE_TYPE: &'static str = "test.tally";
    const SUPPORTS_SNAPSHOTS: bool = true;

    fn new(registry: Arc<ApplyRegistry<Self>>) -> Self {
        Self {
            state: TallyState::default(),
            stream: EventStream::new(registry),
        }
    }

    fn register_handlers(
        registry: ApplyRegistryBuilder<Self>,
    ) -> Result<ApplyRegistryBuilder<Self>, DomainError> {
        registry
            .on(|tally: &mut Self, e: &TallyOpened| tally.state.label.clone_from(&e.label))?
            .on(|tally: &mut Self, e: &TallyAdded| tally.state.total += e.amount)
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

/// A blank tally backed by a freshly built registry.
///
/// # Panics
///
/// Panics if the tally's handler declarations are invalid.
#[must_use]
pub fn new_tally() -> Tally {
    Tally::new(tally_registry())
}

/// The tally apply registry.
///
/// # Panics
///
/// Panics if the tally's handler declarations are invalid.
#[must_use]
pub fn tally_registry() -> Arc<ApplyRegistry<Tally>> {
    ApplyRegistry::build().unwrap()
}
