//! Polling event bus for stores without a native notify mechanism.
//!
//! `publish` only inserts the event row; one poll task per subscribed
//! channel tails the log by id at a short interval. Latency is bounded by
//! the interval; ordering and at-least-once delivery are identical to the
//! notify-capable bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use tarsy_domain::event::{EventPayload, PublishedEvent};
use tarsy_domain::Result;
use tarsy_store::Store;

use crate::dispatch::{Dispatcher, EventSubscription};
use crate::EventBus;

pub struct PollingEventBus {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    poll_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    streaming_warning: std::sync::Once,
}

impl PollingEventBus {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        Self {
            store,
            dispatcher: Dispatcher::new(),
            poll_interval,
            poll_tasks: Mutex::new(HashMap::new()),
            streaming_warning: std::sync::Once::new(),
        }
    }

    /// Make sure a poll task is tailing `channel`. The task exits on its
    /// own once the channel has no subscribers left.
    async fn ensure_polling(&self, channel: &str) {
        {
            let mut tasks = self.poll_tasks.lock();
            tasks.retain(|_, handle| !handle.is_finished());
            if tasks.contains_key(channel) {
                return;
            }
        }

        // Start tailing at the current head so subscribers only see new
        // events; history is the catch-up API's job.
        let mut last_id = self.store.latest_event_id(channel).await.unwrap_or(0);
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.poll_interval;
        let poll_channel = channel.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !dispatcher.has_subscribers(&poll_channel) {
                    tracing::debug!(channel = %poll_channel, "no subscribers left, stopping poll task");
                    return;
                }
                match store.get_events_after(&poll_channel, last_id, 100).await {
                    Ok(events) => {
                        for event in events {
                            last_id = last_id.max(event.id);
                            dispatcher.dispatch(&PublishedEvent {
                                id: Some(event.id),
                                channel: event.channel,
                                payload: with_id(event.payload, event.id),
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %poll_channel, error = %e, "event poll failed");
                    }
                }
            }
        });

        self.poll_tasks.lock().insert(channel.to_string(), handle);
    }
}

impl Drop for PollingEventBus {
    fn drop(&mut self) {
        for (_, handle) in self.poll_tasks.lock().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl EventBus for PollingEventBus {
    async fn publish(&self, channel: &str, event: &EventPayload) -> Result<i64> {
        let row = self.store.create_event(channel, event.to_value()).await?;
        tracing::debug!(channel, event_id = row.id, "event created (polling mode)");
        Ok(row.id)
    }

    async fn publish_transient(&self, channel: &str, event: &EventPayload) {
        // No notify transport: only subscribers in this process see
        // transient events in real time. Logged once per bus instance.
        self.streaming_warning.call_once(|| {
            tracing::warn!(
                "store has no notify support; streaming events are delivered in-process only"
            );
        });
        self.dispatcher.dispatch(&PublishedEvent {
            id: None,
            channel: channel.to_string(),
            payload: event.to_value(),
        });
    }

    async fn subscribe(&self, channel: &str) -> EventSubscription {
        let subscription = self.dispatcher.register(channel);
        self.ensure_polling(channel).await;
        subscription
    }

    async fn events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<PublishedEvent>> {
        let events = self.store.get_events_after(channel, after_id, limit).await?;
        Ok(events
            .into_iter()
            .map(|e| PublishedEvent {
                id: Some(e.id),
                channel: e.channel,
                payload: with_id(e.payload, e.id),
            })
            .collect())
    }
}

/// Inject the assigned id into the delivered payload, mirroring what the
/// notify path puts on the wire.
pub(crate) fn with_id(mut payload: serde_json::Value, id: i64) -> serde_json::Value {
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert("id".into(), serde_json::Value::from(id));
    }
    payload
}
