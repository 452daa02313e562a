//! Change events and the listener registry.
//!
//! Every detected change is fanned out to an arbitrary number of independent
//! subscribers (the fan-out publisher, the rule engine, presentation
//! surfaces). Subscribers are keyed by an opaque [`ListenerId`] so any one of
//! them can be removed without disturbing the others.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use super::tag::TagSelection;
use super::value::TagValue;

/// A detected, publishable difference in one tag's value.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Owning device name.
    pub device: String,

    /// Tag name.
    pub tag: String,

    /// Snapshot of the tag's selection at detection time.
    pub selection: TagSelection,

    /// Previous value; `None` on first observation.
    pub old: Option<TagValue>,

    /// New value.
    pub new: TagValue,
}

/// Device health snapshot, published on a fixed cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// Device name.
    pub device: String,

    /// Driver/protocol family name.
    pub driver: String,

    /// Whether the device is currently connected.
    pub online: bool,

    /// Human-readable status (`Connected`, `Error`, ...).
    pub status: String,

    /// Last error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opaque handle identifying one change-event subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Default per-listener queue depth.
const LISTENER_QUEUE: usize = 1024;

/// Registry of change-event subscribers.
///
/// Delivery is best-effort: a listener that falls behind loses events rather
/// than blocking the poll loops. Each listener has its own bounded queue, so
/// one slow consumer never affects another.
pub struct ChangeListeners {
    senders: DashMap<ListenerId, mpsc::Sender<ChangeEvent>>,
    next_id: AtomicU64,
}

impl ChangeListeners {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new listener and return its handle plus event receiver.
    pub fn add(&self) -> (ListenerId, mpsc::Receiver<ChangeEvent>) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        self.senders.insert(id, tx);
        (id, rx)
    }

    /// Remove a listener. Other listeners are unaffected.
    pub fn remove(&self, id: ListenerId) {
        self.senders.remove(&id);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Check if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Deliver an event to every listener, best-effort.
    ///
    /// Listeners whose receiver has been dropped are pruned here.
    pub fn emit(&self, event: &ChangeEvent) {
        let mut dead = Vec::new();
        for entry in self.senders.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop for this listener only.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.senders.remove(&id);
        }
    }
}

impl Default for ChangeListeners {
    fn default() -> Self {
        Self::new()
    }
}
