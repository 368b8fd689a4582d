//! Process-local pub/sub with bounded per-subscriber queues.
//!
//! Publishing never blocks: the subscriber map is snapshotted under a brief
//! read lock, the lock is released, and each subscriber gets a `try_send`.
//! A subscriber whose queue is full loses that event (with a warning); the
//! other subscribers are unaffected. Dropping a [`Subscription`] removes it
//! from the map, so an SSE stream that disconnects (or a cancelled scope
//! that drops its half) unsubscribes automatically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Default per-subscriber queue capacity.
pub const DEFAULT_CAPACITY: usize = 100;

struct Inner<T> {
    topic: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<T>>>,
}

/// Cheap-to-clone bus handle.
pub struct EventBus<T>(Arc<Inner<T>>);

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(topic: &'static str) -> Self {
        Self::with_capacity(topic, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(topic: &'static str, capacity: usize) -> Self {
        Self(Arc::new(Inner {
            topic,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }))
    }

    /// Register a subscriber with its own bounded queue.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.0.capacity);
        self.0.subscribers.write().insert(id, tx);
        tracing::debug!(topic = self.0.topic, subscriber = id, "subscribed");
        Subscription {
            id,
            receiver: rx,
            inner: self.0.clone(),
        }
    }

    /// Deliver an event to every subscriber without blocking. Full queues
    /// drop the event for that subscriber only; closed queues are pruned.
    pub fn publish(&self, event: T) {
        let targets: Vec<(u64, mpsc::Sender<T>)> = {
            let subscribers = self.0.subscribers.read();
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut closed: Vec<u64> = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        topic = self.0.topic,
                        subscriber = id,
                        "subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.0.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.subscribers.read().len()
    }
}

/// One subscriber's end of the bus. Unsubscribes on drop.
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::Receiver<T>,
    inner: Arc<Inner<T>>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Non-blocking poll, mainly for tests.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.inner.subscribers.write().remove(&self.id);
        tracing::debug!(
            topic = self.inner.topic,
            subscriber = self.id,
            "unsubscribed"
        );
    }
}
