//! Aggregate root abstraction.
//!
//! An aggregate is a state machine whose state is derived only from the events
//! applied to it. Each aggregate type declares its apply handlers once, in
//! [`Aggregate::register_handlers`]; the resulting [`ApplyRegistry`] is built
//! at startup and shared by every instance of that type. Version bookkeeping
//! and the uncommitted-event buffer live in [`EventStream`], which each
//! aggregate embeds.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::error::DomainError;
use crate::event::{Event, EventKind, EventMetadata, EventVariant};

/// Version of an aggregate that has no stream yet.
pub const NO_STREAM: i16 = -1;

type ApplyFn<A> =
    Box<dyn Fn(&mut A, &<A as Aggregate>::Kind) -> Result<(), DomainError> + Send + Sync>;

/// Dispatch table from event type name to apply handler for one aggregate type.
pub struct ApplyRegistry<A: Aggregate> {
    handlers: HashMap<&'static str, ApplyFn<A>>,
}

impl<A: Aggregate> ApplyRegistry<A> {
    /// Builds the registry from the aggregate's handler declarations.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if two handlers are declared for
    /// the same event type.
    pub fn build() -> Result<Arc<Self>, DomainError> {
        let builder = A::register_handlers(ApplyRegistryBuilder::new())?;
        Ok(Arc::new(Self {
            handlers: builder.handlers,
        }))
    }

    /// Returns `true` if a handler is registered for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn apply(&self, aggregate: &mut A, kind: &A::Kind) -> Result<(), DomainError> {
        let event_type = kind.event_type();
        let handler =
            self.handlers
                .get(event_type)
                .ok_or_else(|| DomainError::ApplyHandlerMissing {
                    aggregate_type: A::AGGREGATE_TYPE,
                    event_type: event_type.to_owned(),
                })?;
        handler(aggregate, kind)
    }
}

impl<A: Aggregate> fmt::Debug for ApplyRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut event_types: Vec<_> = self.handlers.keys().collect();
        event_types.sort();
        f.debug_struct("ApplyRegistry")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("event_types", &event_types)
            .finish()
    }
}

/// Collects apply handlers while an [`ApplyRegistry`] is being built.
pub struct ApplyRegistryBuilder<A: Aggregate> {
    handlers: HashMap<&'static str, ApplyFn<A>>,
}

impl<A: Aggregate> ApplyRegistryBuilder<A> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for event payload `P`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Configuration` if `P` already has a handler.
    pub fn on<P>(mut self, apply: fn(&mut A, &P)) -> Result<Self, DomainError>
    where
        P: EventVariant<A::Kind>,
    {
        if self.handlers.contains_key(P::MESSAGE_TYPE) {
            return Err(DomainError::Configuration(format!(
                "aggregate type {} declares more than one apply handler for {}",
                A::AGGREGATE_TYPE,
                P::MESSAGE_TYPE
            )));
        }
        self.handlers.insert(
            P::MESSAGE_TYPE,
            Box::new(
                move |aggregate: &mut A, kind: &A::Kind| -> Result<(), DomainError> {
                    let payload = P::extract(kind).ok_or_else(|| {
                        DomainError::Configuration(format!(
                            "event kind {} does not carry a {} payload",
                            kind.event_type(),
                            P::MESSAGE_TYPE
                        ))
                    })?;
                    apply(aggregate, payload);
                    Ok(())
                },
            ),
        );
        Ok(self)
    }
}

/// Version bookkeeping and uncommitted-event buffer of one aggregate instance.
pub struct EventStream<A: Aggregate> {
    registry: Arc<ApplyRegistry<A>>,
    aggregate_key: Option<Uuid>,
    current_version: i16,
    last_committed_version: i16,
    uncommitted: Mutex<Vec<Event<A::Kind>>>,
}

impl<A: Aggregate> EventStream<A> {
    /// Creates an empty stream in the `NoStream` state.
    #[must_use]
    pub fn new(registry: Arc<ApplyRegistry<A>>) -> Self {
        Self {
            registry,
            aggregate_key: None,
            current_version: NO_STREAM,
            last_committed_version: NO_STREAM,
            uncommitted: Mutex::new(Vec::new()),
        }
    }

    /// Key of the stream; `None` until the first event is applied.
    #[must_use]
    pub fn aggregate_key(&self) -> Option<Uuid> {
        self.aggregate_key
    }

    /// Number of events ever applied, minus one.
    #[must_use]
    pub fn current_version(&self) -> i16 {
        self.current_version
    }

    /// Version as of the last successful commit.
    #[must_use]
    pub fn last_committed_version(&self) -> i16 {
        self.last_committed_version
    }

    /// Returns `true` while no event has ever been applied.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.current_version == NO_STREAM
    }

    /// Copies of the events applied since the last commit, in order.
    #[must_use]
    pub fn uncommitted_events(&self) -> Vec<Event<A::Kind>> {
        self.buffer().clone()
    }

    /// Number of events applied since the last commit.
    #[must_use]
    pub fn uncommitted_count(&self) -> usize {
        self.buffer().len()
    }

    /// Returns `true` if there are events waiting to be committed.
    #[must_use]
    pub fn has_uncommitted(&self) -> bool {
        !self.buffer().is_empty()
    }

    /// Clears the uncommitted buffer and records the current version as
    /// committed.
    pub fn mark_committed(&mut self) {
        self.uncommitted
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.last_committed_version = self.current_version;
    }

    /// Positions a freshly created stream at a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateStateMismatch` if the stream already
    /// holds events.
    pub fn restore_from_snapshot(
        &mut self,
        aggregate_key: Uuid,
        version: i16,
    ) -> Result<(), DomainError> {
        if !self.is_new() {
            return Err(DomainError::AggregateStateMismatch {
                aggregate_key: self.aggregate_key,
                event_aggregate_key: aggregate_key,
                current_version: self.current_version,
                target_version: version,
            });
        }
        self.aggregate_key = Some(aggregate_key);
        self.current_version = version;
        self.last_committed_version = version;
        Ok(())
    }

    /// An event may extend the stream only if the stream is empty or already
    /// owned by the event's aggregate, and only at the current position.
    fn check_applicable(&self, metadata: &EventMetadata) -> Result<(), DomainError> {
        let owns_stream =
            self.is_new() || self.aggregate_key == Some(metadata.aggregate_key);
        if owns_stream && self.current_version == metadata.target_version {
            Ok(())
        } else {
            Err(DomainError::AggregateStateMismatch {
                aggregate_key: self.aggregate_key,
                event_aggregate_key: metadata.aggregate_key,
                current_version: self.current_version,
                target_version: metadata.target_version,
            })
        }
    }

    fn advance(&mut self, aggregate_key: Uuid) -> Result<(), DomainError> {
        self.current_version = self.current_version.checked_add(1).ok_or_else(|| {
            DomainError::Infrastructure(format!("version overflow on aggregate {aggregate_key}"))
        })?;
        if self.aggregate_key.is_none() {
            self.aggregate_key = Some(aggregate_key);
        }
        Ok(())
    }

    fn push_uncommitted(&self, event: Event<A::Kind>) {
        self.buffer().push(event);
    }

    fn settle_history(&mut self) {
        self.last_committed_version = self.current_version;
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<Event<A::Kind>>> {
        self.uncommitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: Aggregate> fmt::Debug for EventStream<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("aggregate_key", &self.aggregate_key)
            .field("current_version", &self.current_version)
            .field("last_committed_version", &self.last_committed_version)
            .field("uncommitted", &self.uncommitted_count())
            .finish_non_exhaustive()
    }
}

/// Trait for event-sourced aggregate roots.
pub trait Aggregate: Sized + Send + Sync + 'static {
    /// The event enum this aggregate produces and consumes.
    type Kind: EventKind;

    /// Aggregate type name, used for logging and snapshot partitioning.
    const AGGREGATE_TYPE: &'static str;

    /// Whether the repository should load and save snapshots for this type.
    const SUPPORTS_SNAPSHOTS: bool = false;

    /// Creates a blank instance in the `NoStream` state.
    fn new(registry: Arc<ApplyRegistry<Self>>) -> Self;

    /// Declares one apply handler per event type.
    ///
    /// # Errors
    ///
    /// Propagates the builder's duplicate-registration error.
    fn register_handlers(
        registry: ApplyRegistryBuilder<Self>,
    ) -> Result<ApplyRegistryBuilder<Self>, DomainError>;

    /// The embedded stream bookkeeping.
    fn stream(&self) -> &EventStream<Self>;

    /// The embedded stream bookkeeping, mutably.
    fn stream_mut(&mut self) -> &mut EventStream<Self>;

    /// Serializes the aggregate's state for a snapshot.
    ///
    /// # Errors
    ///
    /// The default returns `DomainError::Configuration`; snapshot-capable
    /// aggregates override it.
    fn snapshot_state(&self) -> Result<serde_json::Value, DomainError> {
        Err(DomainError::Configuration(format!(
            "aggregate type {} does not support snapshots",
            Self::AGGREGATE_TYPE
        )))
    }

    /// Restores state previously produced by [`Aggregate::snapshot_state`].
    ///
    /// # Errors
    ///
    /// The default returns `DomainError::Configuration`; snapshot-capable
    /// aggregates override it.
    fn restore_state(&mut self, _state: serde_json::Value) -> Result<(), DomainError> {
        Err(DomainError::Configuration(format!(
            "aggregate type {} does not support snapshots",
            Self::AGGREGATE_TYPE
        )))
    }

    /// Key of the aggregate; `None` until the first event is applied.
    fn aggregate_key(&self) -> Option<Uuid> {
        self.stream().aggregate_key()
    }

    /// Current version of the aggregate.
    fn current_version(&self) -> i16 {
        self.stream().current_version()
    }

    /// Applies a newly raised event and buffers it for commit.
    ///
    /// The event's target version is set to the aggregate's current version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateStateMismatch` if the event belongs to a
    /// different aggregate, or `DomainError::ApplyHandlerMissing` if its type
    /// has no handler.
    fn apply_new(&mut self, mut event: Event<Self::Kind>) -> Result<(), DomainError> {
        event.metadata.target_version = self.stream().current_version();
        self.apply_event(&event)?;
        self.stream().push_uncommitted(event);
        Ok(())
    }

    /// Replays persisted events without buffering them.
    ///
    /// # Errors
    ///
    /// Fails on the first event that does not extend the stream at the
    /// current position or has no handler.
    fn load_from_history<I>(&mut self, events: I) -> Result<(), DomainError>
    where
        I: IntoIterator<Item = Event<Self::Kind>>,
    {
        for event in events {
            self.apply_event(&event)?;
        }
        self.stream_mut().settle_history();
        Ok(())
    }

    /// Validates and dispatches one event, then advances the version.
    ///
    /// # Errors
    ///
    /// See [`Aggregate::apply_new`].
    fn apply_event(&mut self, event: &Event<Self::Kind>) -> Result<(), DomainError> {
        self.stream().check_applicable(&event.metadata)?;
        let registry = Arc::clone(&self.stream().registry);
        registry.apply(self, &event.kind)?;
        self.stream_mut().advance(event.metadata.aggregate_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::unknown_event_type;
    use crate::message::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Incremented {
        by: i64,
    }

    impl Message for Incremented {
        const MESSAGE_TYPE: &'static str = "test.incremented";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reset;

    impl Message for Reset {
        const MESSAGE_TYPE: &'static str = "test.reset";
    }

    #[derive(Debug, Clone, PartialEq)]
    enum CounterEvent {
        Incremented(Incremented),
        Reset(Reset),
    }

    impl EventKind for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Incremented(_) => Incremented::MESSAGE_TYPE,
                Self::Reset(_) => Reset::MESSAGE_TYPE,
            }
        }

        fn to_body(&self) -> Result<serde_json::Value, DomainError> {
            Ok(match self {
                Self::Incremented(e) => serde_json::to_value(e)?,
                Self::Reset(e) => serde_json::to_value(e)?,
            })
        }

        fn from_body(event_type: &str, body: serde_json::Value) -> Result<Self, DomainError> {
            match event_type {
                Incremented::MESSAGE_TYPE => Ok(Self::Incremented(serde_json::from_value(body)?)),
                Reset::MESSAGE_TYPE => Ok(Self::Reset(serde_json::from_value(body)?)),
                other => Err(unknown_event_type("test.counter", other)),
            }
        }
    }

    impl EventVariant<CounterEvent> for Incremented {
        fn extract(kind: &CounterEvent) -> Option<&Self> {
            match kind {
                CounterEvent::Incremented(e) => Some(e),
                CounterEvent::Reset(_) => None,
            }
        }
    }

    impl EventVariant<CounterEvent> for Reset {
        fn extract(kind: &CounterEvent) -> Option<&Self> {
            match kind {
                CounterEvent::Reset(e) => Some(e),
                CounterEvent::Incremented(_) => None,
            }
        }
    }

    struct Counter {
        total: i64,
        stream: EventStream<Self>,
    }

    impl Counter {
        fn increment(&mut self, key: Uuid, by: i64) -> Result<(), DomainError> {
            let metadata = EventMetadata::new(key, Uuid::nil(), Uuid::new_v4());
            self.apply_new(Event::new(
                metadata,
                CounterEvent::Incremented(Incremented { by }),
            ))
        }
    }

    impl Aggregate for Counter {
        type Kind = CounterEvent;
        const AGGREGATE_TYPE: &'static str = "test.counter";

        fn new(registry: Arc<ApplyRegistry<Self>>) -> Self {
            Self {
                total: 0,
                stream: EventStream::new(registry),
            }
        }

        fn register_handlers(
            registry: ApplyRegistryBuilder<Self>,
        ) -> Result<ApplyRegistryBuilder<Self>, DomainError> {
            registry.on(|counter: &mut Self, event: &Incremented| counter.total += event.by)
        }

        fn stream(&self) -> &EventStream<Self> {
            &self.stream
        }

        fn stream_mut(&mut self) -> &mut EventStream<Self> {
            &mut self.stream
        }
    }

    fn counter() -> Counter {
        Counter::new(ApplyRegistry::build().unwrap())
    }

    #[test]
    fn test_fresh_aggregate_has_no_stream_then_version_zero() {
        // Arrange
        let mut counter = counter();
        assert_eq!(counter.current_version(), NO_STREAM);
        assert_eq!(counter.aggregate_key(), None);
        let key = Uuid::new_v4();

        // Act
        counter.increment(key, 1).unwrap();

        // Assert
        assert_eq!(counter.current_version(), 0);
        assert_eq!(counter.aggregate_key(), Some(key));
    }

    #[test]
    fn test_n_events_bump_version_and_buffer_until_commit() {
        // Arrange
        let mut counter = counter();
        let key = Uuid::new_v4();

        // Act
        for _ in 0..7 {
            counter.increment(key, 2).unwrap();
        }

        // Assert
        assert_eq!(counter.current_version(), 6);
        assert_eq!(counter.stream().uncommitted_count(), 7);
        assert_eq!(counter.stream().last_committed_version(), NO_STREAM);
        let targets: Vec<i16> = counter
            .stream()
            .uncommitted_events()
            .iter()
            .map(|e| e.metadata.target_version)
            .collect();
        assert_eq!(targets, vec![-1, 0, 1, 2, 3, 4, 5]);

        counter.stream_mut().mark_committed();
        assert_eq!(counter.stream().uncommitted_count(), 0);
        assert_eq!(counter.stream().last_committed_version(), 6);
    }

    #[test]
    fn test_replaying_history_reproduces_live_state() {
        // Arrange
        let mut live = counter();
        let key = Uuid::new_v4();
        for by in [3, 5, -2] {
            live.increment(key, by).unwrap();
        }
        let history = live.stream().uncommitted_events();

        // Act
        let mut replayed = counter();
        replayed.load_from_history(history).unwrap();

        // Assert
        assert_eq!(replayed.total, live.total);
        assert_eq!(replayed.current_version(), live.current_version());
        assert_eq!(replayed.aggregate_key(), live.aggregate_key());
        assert_eq!(replayed.stream().last_committed_version(), 2);
        assert!(!replayed.stream().has_uncommitted());
    }

    #[test]
    fn test_event_for_another_aggregate_is_rejected() {
        let mut counter = counter();
        counter.increment(Uuid::new_v4(), 1).unwrap();

        let result = counter.increment(Uuid::new_v4(), 1);

        assert!(matches!(
            result,
            Err(DomainError::AggregateStateMismatch { current_version: 0, .. })
        ));
        assert_eq!(counter.current_version(), 0);
    }

    #[test]
    fn test_history_out_of_position_is_rejected() {
        let key = Uuid::new_v4();
        let mut metadata = EventMetadata::new(key, Uuid::nil(), Uuid::new_v4());
        metadata.target_version = 3;
        let event = Event::new(metadata, CounterEvent::Incremented(Incremented { by: 1 }));

        let result = counter().load_from_history(vec![event]);

        assert!(matches!(
            result,
            Err(DomainError::AggregateStateMismatch {
                current_version: NO_STREAM,
                target_version: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_apply_handler_fails() {
        let mut counter = counter();
        let metadata = EventMetadata::new(Uuid::new_v4(), Uuid::nil(), Uuid::new_v4());

        let result = counter.apply_new(Event::new(metadata, CounterEvent::Reset(Reset)));

        match result {
            Err(DomainError::ApplyHandlerMissing {
                aggregate_type,
                event_type,
            }) => {
                assert_eq!(aggregate_type, "test.counter");
                assert_eq!(event_type, "test.reset");
            }
            other => panic!("expected ApplyHandlerMissing, got {other:?}"),
        }
        assert_eq!(counter.current_version(), NO_STREAM);
        assert!(!counter.stream().has_uncommitted());
    }

    #[test]
    fn test_duplicate_apply_handler_registration_fails_fast() {
        let builder = ApplyRegistryBuilder::<Counter>::new()
            .on(|counter: &mut Counter, event: &Incremented| counter.total += event.by)
            .unwrap();

        let result = builder.on(|counter: &mut Counter, _: &Incremented| counter.total = 0);

        assert!(matches!(result, Err(DomainError::Configuration(_))));
    }

    #[test]
    fn test_restore_from_snapshot_positions_stream() {
        let mut counter = counter();
        let key = Uuid::new_v4();

        counter.stream_mut().restore_from_snapshot(key, 9).unwrap();

        assert_eq!(counter.current_version(), 9);
        assert_eq!(counter.stream().last_committed_version(), 9);
        assert!(counter.stream_mut().restore_from_snapshot(key, 12).is_err());
    }

    #[test]
    fn test_uncommitted_buffer_is_readable_across_threads() {
        let mut counter = counter();
        let key = Uuid::new_v4();
        counter.increment(key, 1).unwrap();
        let counter = Arc::new(counter);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || counter.stream().uncommitted_count())
            })
            .collect();

        for reader in readers {
            assert_eq!(reader.join().unwrap(), 1);
        }
    }
}
