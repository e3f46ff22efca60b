//! Event hub - fan-out of events to any number of subscribers
//!
//! Every subscriber receives every event published after it subscribed.
//! Subscribing never replaces an existing subscriber.

use tokio::sync::broadcast;

/// Default buffered events per subscriber before it starts lagging
pub const DEFAULT_HUB_CAPACITY: usize = 1024;

/// Broadcast hub for one event type
pub struct EventHub<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventHub<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; returns the number of subscribers that will see it
    pub fn emit(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Default for EventHub<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}
