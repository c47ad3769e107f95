//! Fan-out of store events to subscribers.
//!
//! Events are published after the commit that caused them, while the
//! setup's commit lock is held, so every subscriber sees them in commit
//! order. Subscribers that dropped their receiver are pruned on the next
//! publish.

use crate::types::StoreEvent;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Distributes [`StoreEvent`]s of one setup.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<StoreEvent>>>,
}

impl ChangeFeed {
    /// Creates a feed without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> StoreEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        StoreEvents { rx }
    }

    /// Sends `event` to every live subscriber.
    pub fn publish(&self, event: StoreEvent) {
        let mut closed = false;
        for subscriber in self.subscribers.read().iter() {
            if subscriber.send(event.clone()).is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.is_closed());
        }
    }

    /// Publishes several events in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = StoreEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().iter().filter(|s| !s.is_closed()).count()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving end of a [`ChangeFeed`] subscription.
#[derive(Debug)]
pub struct StoreEvents {
    rx: UnboundedReceiver<StoreEvent>,
}

impl StoreEvents {
    /// Waits for the next event. Returns `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every queued event.
    pub fn drain(&mut self) -> Vec<StoreEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeEvent, ObjectKey};

    fn changed(id: &str) -> StoreEvent {
        StoreEvent::Changed(ChangeEvent {
            key: ObjectKey::new("Note", id),
            deleted: false,
        })
    }

    #[test]
    fn all_subscribers_receive_in_order() {
        let feed = ChangeFeed::new();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.publish_all([changed("1"), changed("2"), StoreEvent::Reset]);

        let expected = vec![changed("1"), changed("2"), StoreEvent::Reset];
        assert_eq!(a.drain(), expected);
        assert_eq!(b.drain(), expected);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = ChangeFeed::new();
        let keep = feed.subscribe();
        drop(feed.subscribe());
        feed.publish(changed("1"));
        assert_eq!(feed.subscriber_count(), 1);
        drop(keep);
        assert_eq!(feed.subscriber_count(), 0);
    }
}
