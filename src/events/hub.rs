//! Per-project fan-out of mutation events.
//!
//! Delivery is best-effort and never blocks the publisher: each subscriber
//! owns a bounded outbox and is dropped on overflow or disconnect, so a
//! slow consumer can only lose its own connection. Per-channel ordering
//! follows publish order because publishing happens inside the project
//! coordinator's critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use super::{Channel, Event};

/// Bound on each subscriber's outbox.
const OUTBOX_CAPACITY: usize = 256;

/// Opaque subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    channels: Vec<Channel>,
    outbox: mpsc::Sender<Event>,
}

/// Multi-subscriber fan-out for one project.
pub struct SubscriberHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriberHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber for `channels`; returns its id and outbox.
    pub fn subscribe(&self, channels: Vec<Channel>) -> (SubscriberId, mpsc::Receiver<Event>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(
                id,
                Subscriber {
                    channels,
                    outbox: tx,
                },
            );
        }
        (id, rx)
    }

    /// Remove a subscriber (normal disconnect).
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }

    /// Deliver `event` to every subscriber of its channel.
    ///
    /// Never blocks: a full or closed outbox drops that subscriber.
    pub fn publish(&self, event: &Event) {
        let channel = event.channel();
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|id, subscriber| {
            if !subscriber.channels.contains(&channel) {
                return true;
            }
            match subscriber.outbox.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id.0, "outbox full, dropping subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriberHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
