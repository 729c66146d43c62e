//! Action/response correlation
//!
//! Every tracked action gets an internal id `<identity>_<counter>`. Tables are
//! keyed by a hash of that id and guarded by their own mutex, separate from
//! the socket writer lock. Sinks are always removed from the table before
//! they are invoked, and invoked after the lock is released.

use crate::{
    error::{AmiError, AmiResult},
    event::ManagerEvent,
    response::{ManagerResponse, ResponseEvents},
};
use std::collections::hash_map::{DefaultHasher, RandomState};
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Callback form of a response handler.
pub type ResponseCallback = Box<dyn FnOnce(AmiResult<ManagerResponse>) + Send + 'static>;

/// Where a correlated response goes.
pub(crate) enum ResponseSink {
    /// A task blocked in a send call.
    Waiter(oneshot::Sender<AmiResult<ManagerResponse>>),
    /// A fire-and-forget callback.
    Callback(ResponseCallback),
    /// The collector of an event-generating action.
    Events(Arc<EventCollector>),
}

impl ResponseSink {
    /// Hand over the result. Never panics into the caller.
    pub(crate) fn deliver(self, result: AmiResult<ManagerResponse>) {
        match self {
            ResponseSink::Waiter(tx) => {
                if tx
                    .send(result)
                    .is_err()
                {
                    trace!("Response waiter already gone");
                }
            }
            ResponseSink::Callback(callback) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    error!("Response callback panicked");
                }
            }
            ResponseSink::Events(collector) => match result {
                Ok(response) => collector.on_response(response),
                Err(e) => collector.fail(e),
            },
        }
    }
}

struct CollectorState {
    collected: ResponseEvents,
    terminal_seen: bool,
}

/// Accumulates the response and event list of one event-generating action.
///
/// Complete once the completion event and the response have both arrived, or
/// as soon as the response is an error.
pub(crate) struct EventCollector {
    completion_kind: String,
    state: Mutex<CollectorState>,
    done: Mutex<Option<oneshot::Sender<AmiResult<()>>>>,
}

impl EventCollector {
    pub(crate) fn new(completion_kind: &str) -> (Arc<Self>, oneshot::Receiver<AmiResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let collector = Arc::new(Self {
            completion_kind: completion_kind.to_string(),
            state: Mutex::new(CollectorState {
                collected: ResponseEvents::default(),
                terminal_seen: false,
            }),
            done: Mutex::new(Some(tx)),
        });
        (collector, rx)
    }

    pub(crate) fn on_response(&self, response: ManagerResponse) {
        let complete = {
            let mut state = lock(&self.state);
            let is_error = response.is_error();
            state
                .collected
                .set_response(response);
            is_error || state.terminal_seen
        };
        if complete {
            self.finish(Ok(()));
        }
    }

    /// Returns `true` when this event completed the action.
    pub(crate) fn on_event(&self, event: ManagerEvent) -> bool {
        let complete = {
            let mut state = lock(&self.state);
            let terminal = event.kind() == self.completion_kind;
            state
                .collected
                .push_event(event);
            if terminal {
                state.terminal_seen = true;
            }
            terminal
                && state
                    .collected
                    .response()
                    .is_some()
        };
        if complete {
            self.finish(Ok(()));
        }
        complete
    }

    pub(crate) fn fail(&self, err: AmiError) {
        self.finish(Err(err));
    }

    /// Snapshot of everything collected so far.
    pub(crate) fn take(&self) -> ResponseEvents {
        std::mem::take(&mut lock(&self.state).collected)
    }

    fn finish(&self, result: AmiResult<()>) {
        if result.is_ok() {
            lock(&self.state)
                .collected
                .mark_complete();
        }
        if let Some(tx) = lock(&self.done).take() {
            let _ = tx.send(result);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Stable numeric key for an internal id.
pub(crate) fn correlation_hash(internal_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    internal_id.hash(&mut hasher);
    hasher.finish()
}

struct PendingRequest {
    action: String,
    sink: ResponseSink,
}

#[derive(Default)]
struct Tables {
    responses: HashMap<u64, PendingRequest>,
    event_subscriptions: HashMap<u64, Arc<EventCollector>>,
}

/// Pending-request and event-subscription tables for one connection.
pub(crate) struct Correlator {
    identity: String,
    counter: AtomicU64,
    tables: Mutex<Tables>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        let seed = RandomState::new().hash_one(std::process::id());
        Self::with_identity(format!("{:08x}", seed as u32))
    }

    pub(crate) fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            counter: AtomicU64::new(0),
            tables: Mutex::new(Tables::default()),
        }
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    /// Next internal id. Monotonic for the life of the connection, so ids
    /// stay unique across reconnects.
    pub(crate) fn next_internal_id(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.identity, n)
    }

    /// Track a pending request. Fails if the key is already taken.
    pub(crate) fn register(
        &self,
        internal_id: &str,
        action: &str,
        sink: ResponseSink,
    ) -> AmiResult<u64> {
        let hash = correlation_hash(internal_id);
        let mut tables = lock(&self.tables);
        if tables
            .responses
            .contains_key(&hash)
        {
            return Err(AmiError::DuplicateHandler {
                action_id: internal_id.to_string(),
            });
        }
        tables
            .responses
            .insert(
                hash,
                PendingRequest {
                    action: action.to_string(),
                    sink,
                },
            );
        Ok(hash)
    }

    /// Route events carrying `internal_id` to `collector`.
    pub(crate) fn register_events(
        &self,
        internal_id: &str,
        collector: Arc<EventCollector>,
    ) -> AmiResult<u64> {
        let hash = correlation_hash(internal_id);
        let mut tables = lock(&self.tables);
        if tables
            .event_subscriptions
            .contains_key(&hash)
        {
            return Err(AmiError::DuplicateHandler {
                action_id: internal_id.to_string(),
            });
        }
        tables
            .event_subscriptions
            .insert(hash, collector);
        Ok(hash)
    }

    /// Drop both table entries for `hash`. Returns `true` if a pending
    /// response handler was still registered.
    pub(crate) fn deregister(&self, hash: u64) -> bool {
        let mut tables = lock(&self.tables);
        tables
            .event_subscriptions
            .remove(&hash);
        tables
            .responses
            .remove(&hash)
            .is_some()
    }

    /// Remove and return the sink waiting for `internal_id`.
    pub(crate) fn take_pending(&self, internal_id: &str) -> Option<ResponseSink> {
        let hash = correlation_hash(internal_id);
        let pending = lock(&self.tables)
            .responses
            .remove(&hash)?;
        trace!("Matched response for {} ({})", internal_id, pending.action);
        Some(pending.sink)
    }

    /// Collector subscribed to events of `internal_id`.
    pub(crate) fn event_collector(&self, internal_id: &str) -> Option<Arc<EventCollector>> {
        let hash = correlation_hash(internal_id);
        lock(&self.tables)
            .event_subscriptions
            .get(&hash)
            .cloned()
    }

    pub(crate) fn remove_event_collector(&self, internal_id: &str) {
        let hash = correlation_hash(internal_id);
        lock(&self.tables)
            .event_subscriptions
            .remove(&hash);
    }

    /// Fail every pending request. Sinks run after the lock is released.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> AmiError) -> usize {
        let (responses, collectors) = {
            let mut tables = lock(&self.tables);
            (
                std::mem::take(&mut tables.responses),
                std::mem::take(&mut tables.event_subscriptions),
            )
        };
        let count = responses.len();
        if count > 0 {
            debug!("Failing {} pending request(s)", count);
        }
        for (_, pending) in responses {
            pending
                .sink
                .deliver(Err(make_err()));
        }
        for (_, collector) in collectors {
            collector.fail(make_err());
        }
        count
    }

    pub(crate) fn pending_count(&self) -> usize {
        lock(&self.tables)
            .responses
            .len()
    }
}

/// Deregisters a request when dropped, whatever way the wait ended.
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    hash: u64,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(correlator: &'a Correlator, hash: u64) -> Self {
        Self { correlator, hash }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator
            .deregister(self.hash);
    }
}
