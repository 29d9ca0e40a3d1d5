//! In-process subscriber bookkeeping shared by both bus implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use tarsy_domain::event::PublishedEvent;

struct Entry {
    id: u64,
    sender: mpsc::UnboundedSender<PublishedEvent>,
}

/// channel → subscriber senders. All critical sections are O(subscribers).
#[derive(Default)]
pub(crate) struct Dispatcher {
    subscribers: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, channel: &str) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Entry { id, sender: tx });
        EventSubscription {
            id,
            channel: channel.to_string(),
            rx,
            dispatcher: Arc::clone(self),
        }
    }

    fn unregister(&self, channel: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(channel) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                subscribers.remove(channel);
            }
        }
    }

    /// Deliver to every live subscriber of `channel`. Dead receivers are
    /// pruned lazily on the next delivery.
    pub fn dispatch(&self, event: &PublishedEvent) {
        let subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get(&event.channel) {
            for entry in entries {
                let _ = entry.sender.send(event.clone());
            }
        }
    }

    pub fn has_subscribers(&self, channel: &str) -> bool {
        self.subscribers.lock().contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.subscribers.lock().keys().cloned().collect()
    }
}

/// A live channel subscription. Dropping it unregisters the callback — the
/// hub relies on this ordering when tearing down a connection.
pub struct EventSubscription {
    id: u64,
    channel: String,
    rx: mpsc::UnboundedReceiver<PublishedEvent>,
    dispatcher: Arc<Dispatcher>,
}

impl EventSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<PublishedEvent> {
        self.rx.recv().await
    }

    /// Non-blocking drain, for tests.
    pub fn try_recv(&mut self) -> Option<PublishedEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.dispatcher.unregister(&self.channel, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(channel: &str, id: i64) -> PublishedEvent {
        PublishedEvent {
            id: Some(id),
            channel: channel.to_string(),
            payload: serde_json::json!({"n": id}),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_all_channel_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.register("sessions");
        let mut b = dispatcher.register("sessions");
        let mut other = dispatcher.register("cancellations");

        dispatcher.dispatch(&event("sessions", 1));

        assert_eq!(a.recv().await.unwrap().id, Some(1));
        assert_eq!(b.recv().await.unwrap().id, Some(1));
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.register("sessions");
        assert!(dispatcher.has_subscribers("sessions"));
        drop(sub);
        assert!(!dispatcher.has_subscribers("sessions"));
    }

    #[tokio::test]
    async fn events_arrive_in_dispatch_order() {
        let dispatcher = Dispatcher::new();
        let mut sub = dispatcher.register("c");
        for i in 1..=5 {
            dispatcher.dispatch(&event("c", i));
        }
        for i in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().id, Some(i));
        }
    }
}
