//! Change notifications.
//!
//! Every structural mutation publishes a [`GraphEvent`] synchronously on the
//! mutating thread, before the mutating call returns and while its locks are
//! still held. The link cache and the scalar index are ordinary sinks on the
//! same bus, so they have reconverged before any other thread can lock the
//! affected entities.
//!
//! Sinks must not request graph locks from inside `on_event`; lock sets are
//! not re-entrant.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::id::NeuronId;
use crate::neuron::{LinkEnds, ScalarValue, TypeTag};

// ── Event types ─────────────────────────────────────────────────────────

/// A graph-wide change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// An entity was committed with a durable id.
    Created { id: NeuronId, tag: TypeTag },
    /// An entity was destroyed.
    Removed { id: NeuronId, tag: TypeTag },
    /// A neuron's payload changed (scalar value, cluster members or meaning).
    NeuronChanged { id: NeuronId },
    /// A link appeared, disappeared, or had its endpoints changed.
    ///
    /// `before` is `None` for a new link, `after` is `None` for a removed one.
    /// `target_value` is the scalar carried by the new To-entity, if any.
    LinkChanged {
        link: NeuronId,
        before: Option<LinkEnds>,
        after: Option<LinkEnds>,
        target_value: Option<ScalarValue>,
    },
    /// A clean entity left the resident cache.
    Evicted { id: NeuronId },
    /// Everything was evicted and the backing medium detached.
    Cleared,
    /// A graph file was attached.
    AfterLoaded { path: PathBuf, records: usize },
}

// ── Sinks ───────────────────────────────────────────────────────────────

/// A destination for graph events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &GraphEvent);
}

impl<F> EventSink for F
where
    F: Fn(&GraphEvent) + Send + Sync,
{
    fn on_event(&self, event: &GraphEvent) {
        self(event)
    }
}

/// Sink that records every event, for tests and tooling.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<GraphEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all recorded events, leaving the log empty.
    pub fn drain(&self) -> Vec<GraphEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for EventLog {
    fn on_event(&self, event: &GraphEvent) {
        self.events.lock().push(event.clone());
    }
}

// ── Bus ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    sinks: RwLock<Vec<(u64, Arc<dyn EventSink>)>>,
}

/// Publish/subscribe hub owned by one graph.
#[derive(Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. It stays registered until the handle is dropped.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sinks.write().push((id, sink));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver an event to every sink, in subscription order.
    ///
    /// The sink list is snapshotted first, so sinks may subscribe or
    /// unsubscribe while being notified.
    pub fn publish(&self, event: &GraphEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .inner
            .sinks
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for sink in sinks {
            sink.on_event(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle for one registered sink.
///
/// Dropping it unsubscribes. It holds the bus only weakly, so an outstanding
/// subscription never keeps a graph alive.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn cancel(self) {}

    /// Whether the owning bus still exists.
    pub fn is_attached(&self) -> bool {
        self.bus.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.sinks.write().retain(|(id, _)| *id != self.id);
        }
    }
}
