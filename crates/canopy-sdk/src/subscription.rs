//! Path-scoped change subscriptions.
//!
//! The hub is installed as the tree's [`EventSink`]. Each subscriber owns a
//! bounded channel; events are offered with `try_send` so a slow reader can
//! never stall a writer holding the tree lock.

use canopy_tree::{EventSink, NodeEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<NodeEvent>,
}

/// Fan-out of tree events to path subscribers.
pub struct SubscriptionHub {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriptionHub {
    /// Create a hub whose channels hold up to `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every event at or below `prefix`.
    pub fn subscribe(&self, prefix: impl Into<String>) -> mpsc::Receiver<NodeEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let prefix = prefix.into();
        tracing::debug!(%prefix, "added subscriber");
        self.subscribers.lock().push(Subscriber { prefix, tx });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every subscriber. Their receivers observe end of stream.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

impl EventSink for SubscriptionHub {
    fn notify(&self, event: NodeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if !path_matches(&sub.prefix, &event.path) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(dropped)) => {
                    tracing::warn!(
                        prefix = %sub.prefix,
                        node_id = %dropped.node_id,
                        kind = %dropped.kind,
                        "subscriber queue full, dropping event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(prefix = %sub.prefix, "subscriber went away");
                    false
                }
            }
        });
    }
}

/// Segment-aware prefix match: `/a/1` covers `/a/1` and `/a/1/x` but not
/// `/a/10`.
pub fn path_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
