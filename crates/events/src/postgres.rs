//! Notify-capable event bus for Postgres.
//!
//! `publish` inserts the event row and issues `pg_notify` in the same
//! transaction, so a notification is only ever seen for a durably committed
//! event. One listener task per process owns the `PgListener`; it dispatches
//! to in-process subscribers without blocking the notify socket.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;

use tarsy_domain::error::Error;
use tarsy_domain::event::{EventPayload, PublishedEvent};
use tarsy_domain::timestamp::now_us;
use tarsy_domain::Result;
use tarsy_store::{PgStore, Store};

use crate::dispatch::{Dispatcher, EventSubscription};
use crate::polling::with_id;
use crate::EventBus;

/// Postgres rejects NOTIFY payloads near 8 KB; oversized payloads stay
/// durable and are picked up via catch-up instead.
const MAX_NOTIFY_PAYLOAD_BYTES: usize = 7_500;

pub struct PostgresEventBus {
    pool: PgPool,
    store: Arc<PgStore>,
    dispatcher: Arc<Dispatcher>,
    listen_tx: mpsc::UnboundedSender<String>,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PostgresEventBus {
    pub async fn new(store: Arc<PgStore>) -> Result<Self> {
        let pool = store.pool().clone();
        let dispatcher = Dispatcher::new();
        let (listen_tx, listen_rx) = mpsc::unbounded_channel();

        let listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("pg listener: {e}")))?;
        let task = tokio::spawn(listener_loop(listener, listen_rx, Arc::clone(&dispatcher)));

        Ok(Self {
            pool,
            store,
            dispatcher,
            listen_tx,
            listener_task: Mutex::new(Some(task)),
        })
    }
}

impl Drop for PostgresEventBus {
    fn drop(&mut self) {
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
    }
}

/// The single notify loop: LISTENs on demand, parses payloads and hands
/// them to the dispatcher. Dispatch is a non-blocking send per subscriber,
/// so a slow dashboard cannot back up the socket.
async fn listener_loop(
    mut listener: PgListener,
    mut listen_rx: mpsc::UnboundedReceiver<String>,
    dispatcher: Arc<Dispatcher>,
) {
    loop {
        tokio::select! {
            request = listen_rx.recv() => {
                match request {
                    Some(channel) => {
                        if let Err(e) = listener.listen(&channel).await {
                            tracing::warn!(channel = %channel, error = %e, "LISTEN failed");
                        }
                    }
                    None => return,
                }
            }
            notification = listener.recv() => {
                match notification {
                    Ok(n) => {
                        match serde_json::from_str::<serde_json::Value>(n.payload()) {
                            Ok(payload) => {
                                let id = payload.get("id").and_then(|v| v.as_i64());
                                dispatcher.dispatch(&PublishedEvent {
                                    id,
                                    channel: n.channel().to_string(),
                                    payload,
                                });
                            }
                            Err(e) => {
                                tracing::warn!(channel = %n.channel(), error = %e, "unparseable notify payload");
                            }
                        }
                    }
                    Err(e) => {
                        // PgListener reconnects internally; log and keep going.
                        tracing::warn!(error = %e, "notify socket error");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for PostgresEventBus {
    async fn publish(&self, channel: &str, event: &EventPayload) -> Result<i64> {
        let payload = event.to_value();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("begin: {e}")))?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO events (channel, payload, created_at_us)
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(channel)
        .bind(&payload)
        .bind(now_us())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("insert event: {e}")))?;

        let notify_payload = serde_json::to_string(&with_id(payload, id))?;
        if notify_payload.len() <= MAX_NOTIFY_PAYLOAD_BYTES {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel)
                .bind(&notify_payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::StoreUnavailable(format!("notify: {e}")))?;
        } else {
            tracing::debug!(
                channel,
                event_id = id,
                bytes = notify_payload.len(),
                "payload exceeds notify limit; subscribers will catch up by id"
            );
        }

        tx.commit()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("commit: {e}")))?;
        Ok(id)
    }

    async fn publish_transient(&self, channel: &str, event: &EventPayload) {
        // Transient events ride the notify channel only — no row.
        let payload = event.to_value();
        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize transient event");
                return;
            }
        };
        if json.len() > MAX_NOTIFY_PAYLOAD_BYTES {
            tracing::debug!(channel, bytes = json.len(), "transient event too large for notify");
            return;
        }
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&json)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(channel, error = %e, "transient notify failed");
        }
        // Local subscribers hear it through the listener loop like everyone
        // else; no double dispatch here.
    }

    async fn subscribe(&self, channel: &str) -> EventSubscription {
        let subscription = self.dispatcher.register(channel);
        if self.listen_tx.send(channel.to_string()).is_err() {
            tracing::warn!(channel, "listener task is gone; live delivery unavailable");
        }
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
