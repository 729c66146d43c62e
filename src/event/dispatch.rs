//! Event delivery to subscribers and the unhandled-event queue

use super::{normalize_kind_name, ManagerEvent};
use crate::{config::DispatchMode, error::AmiError};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&ManagerEvent) + Send + Sync>;

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kind: Option<String>,
    handler: EventHandler,
    /// Set in async mode: events go through this subscriber's own task.
    queue: Option<mpsc::Sender<Arc<ManagerEvent>>>,
}

impl Subscriber {
    fn matches(&self, kind: &str) -> bool {
        self.kind
            .as_deref()
            .map_or(true, |k| k == kind)
    }

    /// Returns `false` when the event was dropped on a full queue.
    fn deliver(&self, event: &Arc<ManagerEvent>) -> bool {
        let Some(tx) = &self.queue else {
            invoke(&self.handler, event);
            return true;
        };
        match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Subscriber {:?} worker has stopped", self.id);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Subscriber {:?} queue full, dropping {} event",
                    self.id,
                    event.kind()
                );
                false
            }
        }
    }
}

fn invoke(handler: &EventHandler, event: &ManagerEvent) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        error!("Event handler panicked on {} event", event.kind());
    }
}

async fn subscriber_worker(
    handler: EventHandler,
    mut rx: mpsc::Receiver<Arc<ManagerEvent>>,
) {
    while let Some(event) = rx
        .recv()
        .await
    {
        invoke(&handler, &event);
    }
}

/// Distributes classified events.
///
/// Subscribers registered for an event's kind (or for every kind) receive it
/// in registration order. An event nobody subscribed to goes to the
/// unhandled queue when that is enabled. Per-action event lists never get
/// here; the connection routes those to their collector first.
pub struct EventDispatcher {
    mode: DispatchMode,
    fire_unhandled: bool,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    suppressed: AtomicBool,
    unhandled_tx: mpsc::Sender<Result<ManagerEvent, AmiError>>,
    /// Set when events have been dropped due to a full queue
    overflow: AtomicBool,
    /// Total count of dropped events
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("mode", &self.mode)
            .field("fire_unhandled", &self.fire_unhandled)
            .field("subscribers", &self.subscriber_count())
            .field("suppressed", &self.is_suppressed())
            .finish()
    }
}

impl EventDispatcher {
    /// Dispatcher feeding unhandled events into `unhandled_tx`.
    pub fn new(
        mode: DispatchMode,
        fire_unhandled: bool,
        unhandled_tx: mpsc::Sender<Result<ManagerEvent, AmiError>>,
    ) -> Self {
        Self {
            mode,
            fire_unhandled,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            suppressed: AtomicBool::new(false),
            unhandled_tx,
            overflow: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Delivery mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Register a handler for one kind (any spelling), or for all events
    /// when `kind` is `None`.
    ///
    /// In [`DispatchMode::Async`] the handler runs on its own task, which
    /// needs a tokio runtime; without one it falls back to inline delivery.
    /// The task's queue holds as many events as the unhandled queue; events
    /// arriving while it is full are dropped and counted.
    pub fn subscribe(&self, kind: Option<&str>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(
            self.next_id
                .fetch_add(1, Ordering::Relaxed),
        );

        let queue = match self.mode {
            DispatchMode::Sync => None,
            DispatchMode::Async => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let (tx, rx) = mpsc::channel(
                        self.unhandled_tx
                            .max_capacity(),
                    );
                    handle.spawn(subscriber_worker(handler.clone(), rx));
                    Some(tx)
                }
                Err(_) => {
                    warn!("No tokio runtime for async subscriber {:?}, delivering inline", id);
                    None
                }
            },
        };

        let subscriber = Arc::new(Subscriber {
            id,
            kind: kind.map(normalize_kind_name),
            handler,
            queue,
        });
        self.write_subscribers()
            .push(subscriber);
        id
    }

    /// Remove a handler. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.write_subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.read_subscribers()
            .len()
    }

    /// While suppressed, only connection-state events are delivered.
    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed
            .store(suppressed, Ordering::Relaxed);
    }

    /// See [`set_suppressed`](Self::set_suppressed).
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
            .load(Ordering::Relaxed)
    }

    /// Events dropped because the unhandled queue or an async subscriber's
    /// queue was full.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped
            .load(Ordering::Relaxed)
    }

    /// Deliver one event.
    ///
    /// Handlers run outside the subscriber lock, so they may subscribe or
    /// unsubscribe themselves.
    pub fn dispatch(&self, event: ManagerEvent) {
        if self.is_suppressed() && !event.is_connection_state() {
            trace!("Dropping {} event while reconnecting", event.kind());
            return;
        }

        let targets: Vec<Arc<Subscriber>> = self
            .read_subscribers()
            .iter()
            .filter(|s| s.matches(event.kind()))
            .cloned()
            .collect();

        if targets.is_empty() {
            if self.fire_unhandled {
                self.send_unhandled(Ok(event));
            } else {
                trace!("No subscriber for {} event", event.kind());
            }
            return;
        }

        let event = Arc::new(event);
        for subscriber in targets {
            if !subscriber.deliver(&event) {
                self.dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Try to queue an event (or error) for the stream via try_send.
    ///
    /// If the queue is full, drop the item, set the overflow flag, and
    /// increment the dropped counter. Before each send, check the overflow
    /// flag and attempt to deliver a QueueFull notification first.
    fn send_unhandled(&self, item: Result<ManagerEvent, AmiError>) {
        if self
            .overflow
            .load(Ordering::Relaxed)
        {
            match self
                .unhandled_tx
                .try_send(Err(AmiError::QueueFull))
            {
                Ok(()) => {
                    self.overflow
                        .store(false, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match self
            .unhandled_tx
            .try_send(item)
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Event stream dropped, discarding unhandled event");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow
                    .store(true, Ordering::Relaxed);
                self.dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Event queue full, dropping event");
            }
        }
    }

    fn read_subscribers(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Subscriber>>> {
        match self
            .subscribers
            .read()
        {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Subscriber>>> {
        match self
            .subscribers
            .write()
        {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
