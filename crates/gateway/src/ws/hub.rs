//! WebSocket hub bookkeeping: connections, channel subscriptions, and the
//! event-bus forwarders that feed them.
//!
//! One forwarder task per subscribed channel (not per connection): the
//! first subscriber starts it, the last one leaving stops it, and stopping
//! drops the bus subscription. Connection teardown unregisters channels
//! *before* removing the connection so no forwarder is ever left pointing
//! at a dead socket.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use tarsy_events::EventBus;

struct Connection {
    sender: mpsc::UnboundedSender<String>,
    channels: HashSet<String>,
}

struct ChannelEntry {
    subscribers: HashSet<String>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<String, Connection>,
    channels: HashMap<String, ChannelEntry>,
}

pub struct WsHub {
    bus: Arc<dyn EventBus>,
    inner: Mutex<HubInner>,
}

impl WsHub {
    pub fn new(bus: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            inner: Mutex::new(HubInner::default()),
        })
    }

    /// Register a connection; frames for the socket arrive on the
    /// returned receiver.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<String>) {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().connections.insert(
            connection_id.clone(),
            Connection {
                sender: tx,
                channels: HashSet::new(),
            },
        );
        tracing::debug!(connection_id = %connection_id, "websocket connection registered");
        (connection_id, rx)
    }

    /// Subscribe a connection to a channel, starting the channel's
    /// forwarder when it is the first subscriber.
    pub async fn subscribe(self: &Arc<Self>, connection_id: &str, channel: &str) -> bool {
        let start_forwarder = {
            let mut inner = self.inner.lock();
            let Some(connection) = inner.connections.get_mut(connection_id) else {
                return false;
            };
            connection.channels.insert(channel.to_string());
            match inner.channels.get_mut(channel) {
                Some(entry) => {
                    entry.subscribers.insert(connection_id.to_string());
                    false
                }
                None => {
                    let mut subscribers = HashSet::new();
                    subscribers.insert(connection_id.to_string());
                    inner.channels.insert(
                        channel.to_string(),
                        ChannelEntry {
                            subscribers,
                            forwarder: None,
                        },
                    );
                    true
                }
            }
        };

        if start_forwarder {
            let mut subscription = self.bus.subscribe(channel).await;
            let hub = Arc::clone(self);
            let forwarded_channel = channel.to_string();
            let handle = tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    hub.broadcast(&forwarded_channel, &event.payload);
                }
            });
            let mut inner = self.inner.lock();
            match inner.channels.get_mut(channel) {
                Some(entry) => entry.forwarder = Some(handle),
                // Everyone unsubscribed while we were setting up.
                None => handle.abort(),
            }
        }
        true
    }

    pub fn unsubscribe(&self, connection_id: &str, channel: &str) {
        let mut inner = self.inner.lock();
        if let Some(connection) = inner.connections.get_mut(connection_id) {
            connection.channels.remove(channel);
        }
        Self::drop_subscriber(&mut inner, connection_id, channel);
    }

    /// Tear down a connection: channel callbacks are unregistered first,
    /// then the connection entry goes away.
    pub fn disconnect(&self, connection_id: &str) {
        let mut inner = self.inner.lock();
        let channels: Vec<String> = inner
            .connections
            .get(connection_id)
            .map(|c| c.channels.iter().cloned().collect())
            .unwrap_or_default();
        for channel in channels {
            Self::drop_subscriber(&mut inner, connection_id, &channel);
        }
        inner.connections.remove(connection_id);
        tracing::debug!(connection_id = %connection_id, "websocket connection removed");
    }

    fn drop_subscriber(inner: &mut HubInner, connection_id: &str, channel: &str) {
        let remove_channel = match inner.channels.get_mut(channel) {
            Some(entry) => {
                entry.subscribers.remove(connection_id);
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if remove_channel {
            if let Some(entry) = inner.channels.remove(channel) {
                if let Some(forwarder) = entry.forwarder {
                    // Aborting drops the bus subscription with the task.
                    forwarder.abort();
                }
            }
        }
    }

    /// Fan one event out to every subscriber of its channel.
    pub fn broadcast(&self, channel: &str, payload: &serde_json::Value) {
        let text = payload.to_string();
        let inner = self.inner.lock();
        let Some(entry) = inner.channels.get(channel) else {
            return;
        };
        for connection_id in &entry.subscribers {
            if let Some(connection) = inner.connections.get(connection_id) {
                let _ = connection.sender.send(text.clone());
            }
        }
    }

    /// Direct frame to one connection (protocol replies).
    pub fn send_to(&self, connection_id: &str, text: String) {
        let inner = self.inner.lock();
        if let Some(connection) = inner.connections.get(connection_id) {
            let _ = connection.sender.send(text);
        }
    }

    /// Catch-up frames for a channel after `last_event_id` (capped).
    pub async fn catchup(
        &self,
        channel: &str,
        last_event_id: i64,
        limit: usize,
    ) -> Vec<serde_json::Value> {
        match self.bus.events_after(channel, last_event_id, limit).await {
            Ok(events) => events.into_iter().map(|e| e.payload).collect(),
            Err(e) => {
                tracing::warn!(channel, error = %e, "catchup query failed");
                Vec::new()
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn channel_subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tarsy_domain::event::EventPayload;
    use tarsy_events::PollingEventBus;
    use tarsy_store::{MemoryStore, Store};

    async fn hub() -> (Arc<WsHub>, Arc<dyn EventBus>) {
        let store = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(PollingEventBus::new(
            store as Arc<dyn Store>,
            Duration::from_millis(20),
        ));
        (WsHub::new(Arc::clone(&bus)), bus)
    }

    fn created(session: &str) -> EventPayload {
        EventPayload::SessionCreated {
            session_id: session.into(),
            alert_type: "kubernetes".into(),
        }
    }

    #[tokio::test]
    async fn subscribed_connection_receives_broadcasts() {
        let (hub, bus) = hub().await;
        let (conn, mut rx) = hub.register();
        assert!(hub.subscribe(&conn, "sessions").await);

        bus.publish("sessions", &created("s1")).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within poll window")
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "session.created");
        assert!(value["id"].as_i64().is_some());
    }

    #[tokio::test]
    async fn unsubscribed_channel_stops_delivering() {
        let (hub, bus) = hub().await;
        let (conn, mut rx) = hub.register();
        hub.subscribe(&conn, "sessions").await;
        hub.unsubscribe(&conn, "sessions");
        assert_eq!(hub.channel_subscriber_count("sessions"), 0);

        bus.publish("sessions", &created("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_unregisters_all_channels_before_removal() {
        let (hub, _bus) = hub().await;
        let (conn, _rx) = hub.register();
        hub.subscribe(&conn, "sessions").await;
        hub.subscribe(&conn, "session:s1").await;
        assert_eq!(hub.connection_count(), 1);

        hub.disconnect(&conn);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.channel_subscriber_count("sessions"), 0);
        assert_eq!(hub.channel_subscriber_count("session:s1"), 0);

        // Idempotent.
        hub.disconnect(&conn);
    }

    #[tokio::test]
    async fn two_connections_share_one_channel() {
        let (hub, bus) = hub().await;
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        hub.subscribe(&a, "sessions").await;
        hub.subscribe(&b, "sessions").await;
        assert_eq!(hub.channel_subscriber_count("sessions"), 2);

        bus.publish("sessions", &created("s1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();

        // First leaver does not tear down the shared channel.
        hub.disconnect(&a);
        assert_eq!(hub.channel_subscriber_count("sessions"), 1);
    }

    #[tokio::test]
    async fn catchup_returns_payloads_with_ids() {
        let (hub, bus) = hub().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(bus.publish("sessions", &created(&format!("s{i}"))).await.unwrap());
        }
        let frames = hub.catchup("sessions", ids[0], 100).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"].as_i64().unwrap(), ids[1]);
        assert_eq!(frames[1]["id"].as_i64().unwrap(), ids[2]);
    }
}
