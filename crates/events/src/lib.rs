//! `tarsy-events` — durable per-channel event log with real-time fan-out.
//!
//! One [`EventBus`] contract, two implementations:
//! - [`PostgresEventBus`]: insert + `NOTIFY` in one transaction; a single
//!   listener task per process owns the notify socket and dispatches to
//!   in-process subscribers.
//! - [`PollingEventBus`]: insert only; per-channel poll tasks tail the event
//!   log. Higher latency, identical correctness.
//!
//! Delivery is at-least-once with client-side dedup by event id: the durable
//! row is the source of truth, catch-up goes through
//! `Store::get_events_after`, and re-delivery can only happen at the
//! replay/live boundary.

pub mod cleanup;
mod dispatch;
pub mod polling;
pub mod postgres;

use async_trait::async_trait;

use tarsy_domain::event::{EventPayload, PublishedEvent};
use tarsy_domain::Result;

pub use cleanup::EventCleanupService;
pub use dispatch::EventSubscription;
pub use polling::PollingEventBus;
pub use postgres::PostgresEventBus;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Persist an event on `channel` and notify subscribers. Returns the
    /// assigned event id.
    async fn publish(&self, channel: &str, event: &EventPayload) -> Result<i64>;

    /// Dispatch without persisting (streaming chunks). Best-effort: on a
    /// polling bus only in-process subscribers see transient events.
    async fn publish_transient(&self, channel: &str, event: &EventPayload);

    /// Subscribe to a channel. Dropping the subscription unregisters it.
    async fn subscribe(&self, channel: &str) -> EventSubscription;

    /// Durable events after `after_id`, for catch-up.
    async fn events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<PublishedEvent>>;
}
