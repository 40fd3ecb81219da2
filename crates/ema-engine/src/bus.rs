use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::error;

use ema_core::events::{ActorEvent, EventEnvelope, EventKind};

type Handler = Arc<dyn Fn(&ActorEvent) + Send + Sync>;

/// Handle returned by `subscribe`; pass it to `unsubscribe` to detach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription(u64);

struct Registered {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

struct BusInner {
    subscribers: RwLock<Vec<Registered>>,
    next_id: AtomicU64,
    relay: broadcast::Sender<EventEnvelope>,
}

/// Typed, per-kind publish/subscribe bus.
///
/// Dispatch is synchronous, in subscription order; a panicking handler
/// is isolated and does not stop delivery to the rest. There is no
/// buffering — events published before a subscription are lost. Every
/// event is additionally relayed as an `EventEnvelope` over a broadcast
/// channel for external consumers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(relay_capacity: usize) -> Self {
        let (relay, _) = broadcast::channel(relay_capacity);
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                relay,
            }),
        }
    }

    /// Subscribe to a single event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&ActorEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&ActorEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(Registered {
            id,
            kind,
            handler,
        });
        Subscription(id)
    }

    /// Detach a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subs = self.inner.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != subscription.0);
        subs.len() != before
    }

    /// Dispatch an event to matching subscribers, then relay the
    /// envelope to external consumers.
    pub fn emit(&self, event: ActorEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let subs = self.inner.subscribers.read();
            subs.iter()
                .filter(|s| s.kind.is_none() || s.kind == Some(kind))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if outcome.is_err() {
                error!(kind = kind.as_str(), "event handler panicked");
            }
        }

        let _ = self.inner.relay.send(EventEnvelope::from(&event));
    }

    /// Receiver for the boundary envelope stream.
    pub fn envelopes(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.relay.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
