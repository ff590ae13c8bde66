//! The event log contract.
//!
//! The event log itself is an external dependency. This module defines the
//! boundary: the event types that travel over it, the subscriber interface
//! through which events are delivered, and the [`EventLog`] trait used to
//! append mutations. [`MemoryEventLog`] is the in-process implementation
//! used by tests and single-process deployments.

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::ident::Identifier;

//------------ MutationEvent -------------------------------------------------

/// An append-log record representing an upsert or delete for one identifier.
#[derive(Clone, Debug)]
pub struct MutationEvent {
    /// The event type this record belongs to.
    pub event_type: String,

    /// The identifier the mutation applies to.
    pub identifier: Identifier,

    /// The encoded value. Empty for tombstones.
    pub payload: Bytes,

    /// The format tag the payload is encoded in.
    pub format: String,

    /// Whether this record deletes the identifier.
    pub deleted: bool,
}

impl MutationEvent {
    /// Creates an upsert record.
    pub fn upsert(
        event_type: impl Into<String>,
        identifier: Identifier,
        payload: Bytes,
        format: impl Into<String>,
    ) -> Self {
        MutationEvent {
            event_type: event_type.into(),
            identifier,
            payload,
            format: format.into(),
            deleted: false,
        }
    }

    /// Creates a tombstone record.
    pub fn tombstone(event_type: impl Into<String>, identifier: Identifier, format: impl Into<String>) -> Self {
        MutationEvent {
            event_type: event_type.into(),
            identifier,
            payload: Bytes::new(),
            format: format.into(),
            deleted: true,
        }
    }
}

//------------ ReplayState ---------------------------------------------------

/// Progress of historical replay for one event type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplayState {
    /// Historical events are being delivered.
    Replaying,

    /// Replay has completed; new events are delivered live.
    Listening,
}

impl Display for ReplayState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayState::Replaying => "replaying",
            ReplayState::Listening => "listening",
        }
        .fmt(f)
    }
}

//------------ StateChangeEvent ----------------------------------------------

/// A log record marking a replay state transition for an event type.
#[derive(Clone, Debug)]
pub struct StateChangeEvent {
    pub event_type: String,
    pub state: ReplayState,
}

//------------ Event ---------------------------------------------------------

/// Everything the log can deliver to a subscriber.
#[derive(Clone, Debug)]
pub enum Event {
    Mutation(MutationEvent),
    StateChange(StateChangeEvent),
}

impl Event {
    /// The event type this event belongs to.
    pub fn event_type(&self) -> &str {
        match self {
            Event::Mutation(event) => &event.event_type,
            Event::StateChange(event) => &event.event_type,
        }
    }
}

//------------ EventSubscriber -----------------------------------------------

/// A consumer of log events.
///
/// Subscribers receive all events for the event types they declare, in the
/// order the log delivers them. Delivery may happen on a dedicated log
/// thread; implementations must not block it for long and must not append
/// to the log from within `on_event`.
pub trait EventSubscriber: Send + Sync {
    /// The event types this subscriber wants to receive.
    fn event_types(&self) -> Vec<String>;

    /// Called for every event of a subscribed type.
    fn on_event(&self, event: &Event);
}

//------------ EventLog ------------------------------------------------------

/// The append and subscribe interface of the external event log.
pub trait EventLog: Send + Sync {
    /// Appends a mutation to the log.
    ///
    /// A successful append only means the log accepted the record. The
    /// mutation becomes visible once the log echoes it back through the
    /// subscription channel.
    fn append(&self, event: MutationEvent) -> Result<(), AppendError>;

    /// Registers a subscriber.
    ///
    /// The log first replays retained history for every subscribed event
    /// type, bracketed by `Replaying` and `Listening` state changes, and
    /// then delivers new events live.
    fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>);
}

//------------ AppendError ---------------------------------------------------

/// Appending to the log failed.
#[derive(Clone, Debug)]
pub struct AppendError(String);

impl AppendError {
    pub fn new(msg: impl Display) -> Self {
        AppendError(msg.to_string())
    }
}

impl Display for AppendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot append to event log: {}", self.0)
    }
}

impl std::error::Error for AppendError {}

//------------ MemoryEventLog ------------------------------------------------

/// An in-process event log.
///
/// Retains every appended event and replays the retained history to late
/// subscribers. Appends and subscriptions are serialized through a single
/// lock, so events for any identifier are delivered in append order.
/// Delivery is synchronous while the lock is held; subscribers must not
/// append from within `on_event`.
#[derive(Default)]
pub struct MemoryEventLog {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    history: Vec<MutationEvent>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, event: MutationEvent) -> Result<(), AppendError> {
        let mut inner = self.inner.lock().map_err(|_| AppendError::new("event log lock poisoned"))?;
        inner.history.push(event.clone());

        let delivered = Event::Mutation(event);
        for subscriber in &inner.subscribers {
            if subscriber.event_types().iter().any(|t| t == delivered.event_type()) {
                subscriber.on_event(&delivered);
            }
        }
        Ok(())
    }

    fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        for event_type in subscriber.event_types() {
            subscriber.on_event(&Event::StateChange(StateChangeEvent {
                event_type: event_type.clone(),
                state: ReplayState::Replaying,
            }));

            for event in inner.history.iter().filter(|e| e.event_type == event_type) {
                subscriber.on_event(&Event::Mutation(event.clone()));
            }

            subscriber.on_event(&Event::StateChange(StateChangeEvent {
                event_type,
                state: ReplayState::Listening,
            }));
        }

        inner.subscribers.push(subscriber);
    }
}

//------------ Tests ---------------------------------------------------------
