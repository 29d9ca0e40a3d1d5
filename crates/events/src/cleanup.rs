//! Background deletion of old event rows.
//!
//! Runs on every replica; deleting by cutoff is idempotent so overlapping
//! sweeps across replicas are harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tarsy_domain::timestamp::now_us;
use tarsy_store::Store;

/// Back off this long after a failed sweep before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(300);

pub struct EventCleanupService {
    store: Arc<dyn Store>,
    retention_hours: u64,
    cleanup_interval: Duration,
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventCleanupService {
    pub fn new(store: Arc<dyn Store>, retention_hours: u64, cleanup_interval_hours: u64) -> Self {
        Self {
            store,
            retention_hours,
            cleanup_interval: Duration::from_secs(cleanup_interval_hours * 3600),
            shutdown: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let store = Arc::clone(&self.store);
        let retention_hours = self.retention_hours;
        let interval = self.cleanup_interval;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let wait = match sweep(&*store, retention_hours).await {
                    Ok(_) => interval,
                    Err(e) => {
                        tracing::error!(error = %e, "event cleanup sweep failed");
                        ERROR_BACKOFF
                    }
                };
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        });
        *self.task.lock() = Some(handle);

        tracing::info!(
            retention_hours = self.retention_hours,
            interval_secs = self.cleanup_interval.as_secs(),
            "event cleanup service started"
        );
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
        tracing::info!("event cleanup service stopped");
    }
}

async fn sweep(store: &dyn Store, retention_hours: u64) -> tarsy_domain::Result<u64> {
    let cutoff_us = now_us() - (retention_hours as i64) * 3_600 * 1_000_000;
    let deleted = store.delete_events_before(cutoff_us).await?;
    if deleted > 0 {
        tracing::info!(deleted, retention_hours, "cleaned up old events");
    } else {
        tracing::debug!("no old events to clean up");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_store::MemoryStore;

    #[tokio::test]
    async fn sweep_deletes_only_expired_events() {
        let store = Arc::new(MemoryStore::new());
        // Two events "now": both younger than any positive retention.
        store
            .create_event("c", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        store
            .create_event("c", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        assert_eq!(sweep(&*store, 24).await.unwrap(), 0);
        // Zero-hour retention expires everything created before "now".
        assert_eq!(sweep(&*store, 0).await.unwrap(), 2);
        // Idempotent: a second identical sweep deletes nothing.
        assert_eq!(sweep(&*store, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_stop_is_clean() {
        let store = Arc::new(MemoryStore::new());
        let service = EventCleanupService::new(store, 24, 6);
        service.start();
        service.stop().await;
    }
}
