//! The event-sourced entity cache.
//!
//! The cache subscribes to the event log and projects mutation events into
//! an in-memory ordered map. Writes go through the log: [`EntityCache::put`]
//! appends a mutation and returns a [`PendingWrite`] future that resolves
//! once the log has echoed the event back and the cache has applied it.
//! Resolution of that future is the read-your-write guarantee; synchronous
//! reads never block on the log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::codec::{CodecError, StoredValues, ValueCodec};
use crate::events::{AppendError, Event, EventLog, EventSubscriber, MutationEvent, ReplayState, StateChangeEvent};
use crate::ident::{Identifier, SegmentBuf};

//------------ SharedValues --------------------------------------------------

/// The cache's value map.
///
/// A cheaply clonable handle, so the map can also be wired into decode
/// stages such as [`crate::codec::MergeWithStored`]. Entries are only ever
/// created, replaced, or removed by the cache's event application routine.
pub struct SharedValues<T> {
    inner: Arc<RwLock<BTreeMap<Identifier, Arc<T>>>>,
}

impl<T> SharedValues<T> {
    pub fn new() -> Self {
        SharedValues {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn get(&self, identifier: &Identifier) -> Option<Arc<T>> {
        self.inner.read().unwrap().get(identifier).cloned()
    }

    pub fn has(&self, identifier: &Identifier) -> bool {
        self.inner.read().unwrap().contains_key(identifier)
    }

    /// All identifiers whose path starts with the given prefix, in order.
    pub fn list(&self, path_prefix: &[SegmentBuf]) -> Vec<Identifier> {
        self.inner
            .read()
            .unwrap()
            .keys()
            .filter(|identifier| identifier.path_starts_with(path_prefix))
            .cloned()
            .collect()
    }

    fn insert(&self, identifier: Identifier, value: Arc<T>) {
        self.inner.write().unwrap().insert(identifier, value);
    }

    fn remove(&self, identifier: &Identifier) {
        self.inner.write().unwrap().remove(identifier);
    }
}

impl<T> Default for SharedValues<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SharedValues<T> {
    fn clone(&self) -> Self {
        SharedValues {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Serialize + Send + Sync> StoredValues for SharedValues<T> {
    fn stored(&self, identifier: &Identifier) -> Option<serde_json::Value> {
        let value = self.get(identifier)?;
        serde_json::to_value(value.as_ref()).ok()
    }
}

//------------ EntityCache ---------------------------------------------------

/// An event-sourced cache of values keyed by [`Identifier`].
///
/// The cache owns no threads; it is driven by whatever delivery mechanism
/// the event log uses, while `put` may be called concurrently from
/// arbitrary caller threads.
pub struct EntityCache<T> {
    /// The event types this cache subscribes to. Mutations are written
    /// under the first one.
    event_types: Vec<String>,

    codec: ValueCodec<T>,
    log: Arc<dyn EventLog>,
    values: SharedValues<T>,

    /// At most one pending write per identifier, tagged with the sequence
    /// number of the write that registered it.
    pending: Mutex<HashMap<Identifier, (u64, oneshot::Sender<WriteOutcome<T>>)>>,
    write_seq: AtomicU64,

    /// Event types that have reported steady state.
    listening: Mutex<HashSet<String>>,
    started: AtomicBool,
    on_start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// What a resolved [`PendingWrite`] yields: the cache's post-application
/// value for the identifier. `Some` after an upsert, `None` after a delete.
pub type WriteOutcome<T> = Result<Option<Arc<T>>, WriteError>;

impl<T> EntityCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a cache with a fresh value map.
    ///
    /// `event_types` must be nonempty; writes are appended under the first
    /// entry.
    pub fn new(event_types: Vec<String>, codec: ValueCodec<T>, log: Arc<dyn EventLog>) -> Arc<Self> {
        Self::with_values(event_types, codec, log, SharedValues::new())
    }

    /// Creates a cache over an existing value map.
    ///
    /// Use this when the map handle was needed earlier, e.g. to wire a
    /// merge stage into the codec.
    pub fn with_values(
        event_types: Vec<String>,
        codec: ValueCodec<T>,
        log: Arc<dyn EventLog>,
        values: SharedValues<T>,
    ) -> Arc<Self> {
        assert!(!event_types.is_empty(), "a cache needs at least one event type");
        Arc::new(EntityCache {
            event_types,
            codec,
            log,
            values,
            pending: Mutex::new(HashMap::new()),
            write_seq: AtomicU64::new(0),
            listening: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            on_start: Mutex::new(None),
        })
    }

    /// Registers the callback invoked once every subscribed event type has
    /// reached steady state. Fires at most once for the cache's lifetime.
    pub fn set_start_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(callback));
    }

    /// Subscribes the cache to its event log.
    pub fn subscribe(self: &Arc<Self>) {
        self.log.subscribe(self.clone());
    }

    /// A handle to the value map, for wiring into decode stages.
    pub fn values(&self) -> SharedValues<T> {
        self.values.clone()
    }
}

// # Write path
impl<T> EntityCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Submits a value for the identifier.
    ///
    /// Serializes the value, appends a mutation event to the log, and
    /// returns immediately. The returned future resolves once the event
    /// has round-tripped through the log and been applied to the cache;
    /// it fails, without the cache being touched, if the append itself
    /// fails.
    pub fn put(&self, identifier: Identifier, value: &T) -> PendingWrite<T> {
        let payload = match self.codec.serialize(value) {
            Ok(payload) => payload,
            Err(error) => return PendingWrite::ready(Err(WriteError::Encode(error))),
        };
        self.put_bytes(identifier, payload, self.codec.default_format().as_str())
    }

    /// Submits an already-encoded payload for the identifier.
    pub fn put_bytes(&self, identifier: Identifier, payload: Bytes, format: &str) -> PendingWrite<T> {
        let event = MutationEvent::upsert(self.write_type(), identifier, payload, format);
        self.submit(event)
    }

    /// Submits a tombstone for the identifier.
    pub fn delete(&self, identifier: Identifier) -> PendingWrite<T> {
        let event = MutationEvent::tombstone(self.write_type(), identifier, self.codec.default_format().as_str());
        self.submit(event)
    }

    fn write_type(&self) -> &str {
        &self.event_types[0]
    }

    fn submit(&self, event: MutationEvent) -> PendingWrite<T> {
        let identifier = event.identifier.clone();
        let (tx, rx) = oneshot::channel();
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);

        // Register before appending: the log may echo the event on the
        // current thread before append returns. Last write wins; a
        // superseded write's future fails explicitly.
        if let Some((_, superseded)) = self.pending.lock().unwrap().insert(identifier.clone(), (seq, tx)) {
            let _ = superseded.send(Err(WriteError::Superseded));
        }

        if let Err(error) = self.log.append(event) {
            // Only clean up this call's own registration. A newer write
            // for the identifier may have replaced it while the append
            // was in flight; its entry must survive until its own echo.
            let mut pending = self.pending.lock().unwrap();
            if pending.get(&identifier).map(|(s, _)| *s) == Some(seq) {
                if let Some((_, tx)) = pending.remove(&identifier) {
                    let _ = tx.send(Err(WriteError::AppendFailed(error)));
                }
            }
        }

        PendingWrite::pending(rx)
    }
}

// # Read path
impl<T> EntityCache<T> {
    /// Returns whether a value is cached for the identifier.
    pub fn has(&self, identifier: &Identifier) -> bool {
        self.values.has(identifier)
    }

    /// Returns the cached value for the identifier.
    pub fn get(&self, identifier: &Identifier) -> Option<Arc<T>> {
        self.values.get(identifier)
    }

    /// All cached identifiers whose path starts with the given prefix.
    /// An empty prefix lists everything.
    pub fn list(&self, path_prefix: &[SegmentBuf]) -> Vec<Identifier> {
        self.values.list(path_prefix)
    }
}

// # Event application
impl<T> EntityCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn apply_mutation(&self, event: &MutationEvent) {
        if event.deleted {
            self.values.remove(&event.identifier);
        } else {
            match self.codec.deserialize(&event.identifier, &event.payload, &event.format) {
                Ok(value) => {
                    self.values.insert(event.identifier.clone(), Arc::new(value));
                }
                Err(error) => {
                    // Non-fatal: keep the previous value, if any. The next
                    // decodable event for this identifier heals the entry.
                    error!(
                        "cannot decode payload for '{}': {}; keeping previous value",
                        event.identifier, error
                    );
                }
            }
        }

        let pending = self.pending.lock().unwrap().remove(&event.identifier);
        if let Some((_, tx)) = pending {
            let _ = tx.send(Ok(self.values.get(&event.identifier)));
        }
    }

    fn apply_state_change(&self, event: &StateChangeEvent) {
        match event.state {
            ReplayState::Replaying => {
                debug!("replaying history for event type '{}'", event.event_type);
            }
            ReplayState::Listening => {
                let all_listening = {
                    let mut listening = self.listening.lock().unwrap();
                    listening.insert(event.event_type.clone());
                    self.event_types.iter().all(|t| listening.contains(t))
                };
                if all_listening && !self.started.swap(true, Ordering::SeqCst) {
                    if let Some(callback) = self.on_start.lock().unwrap().take() {
                        callback();
                    }
                }
            }
        }
    }
}

impl<T> EventSubscriber for EntityCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn event_types(&self) -> Vec<String> {
        self.event_types.clone()
    }

    fn on_event(&self, event: &Event) {
        match event {
            Event::Mutation(event) => self.apply_mutation(event),
            Event::StateChange(event) => self.apply_state_change(event),
        }
    }
}

//------------ PendingWrite --------------------------------------------------

/// The future returned by the cache's write path.
///
/// Resolves with the cache's post-application value once the write has
/// round-tripped through the log. No timeout is applied: an event that is
/// appended but never echoed leaves the future pending; callers needing a
/// bound must wrap it in their own timeout.
pub struct PendingWrite<T> {
    state: PendingWriteState<T>,
}

enum PendingWriteState<T> {
    Ready(Option<WriteOutcome<T>>),
    Waiting(oneshot::Receiver<WriteOutcome<T>>),
}

impl<T> PendingWrite<T> {
    fn ready(outcome: WriteOutcome<T>) -> Self {
        PendingWrite {
            state: PendingWriteState::Ready(Some(outcome)),
        }
    }

    fn pending(rx: oneshot::Receiver<WriteOutcome<T>>) -> Self {
        PendingWrite {
            state: PendingWriteState::Waiting(rx),
        }
    }
}

impl<T> Future for PendingWrite<T> {
    type Output = WriteOutcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingWriteState::Ready(outcome) => {
                Poll::Ready(outcome.take().expect("pending write polled after completion"))
            }
            PendingWriteState::Waiting(rx) => Pin::new(rx).poll(cx).map(|res| match res {
                Ok(outcome) => outcome,
                // The sender side went away without resolving: the write
                // was superseded or the cache was dropped.
                Err(_) => Err(WriteError::Superseded),
            }),
        }
    }
}

//------------ WriteError ----------------------------------------------------

/// This type defines possible errors for the cache's write path.
#[derive(Debug)]
pub enum WriteError {
    /// The value could not be serialized; nothing was appended.
    Encode(CodecError),

    /// The log rejected the append; the cache was not touched.
    AppendFailed(AppendError),

    /// A later write for the same identifier replaced this one.
    Superseded,
}

impl Display for WriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Encode(e) => e.fmt(f),
            WriteError::AppendFailed(e) => e.fmt(f),
            WriteError::Superseded => write!(f, "write superseded by a later write for the same identifier"),
        }
    }
}

impl std::error::Error for WriteError {}

//------------ Tests ---------------------------------------------------------
