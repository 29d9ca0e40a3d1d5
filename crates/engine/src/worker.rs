//! Worker pool: claim-loop tasks that pull PENDING sessions off the
//! shared store.
//!
//! Claiming is a single atomic store operation, so any number of workers
//! across any number of replicas can race safely. Workers back off
//! linearly (250ms → 2s) while the queue is empty.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tarsy_domain::config::Settings;
use tarsy_store::Store;

use crate::runner::SessionRunner;

const BACKOFF_STEP: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

pub struct WorkerPool {
    store: Arc<dyn Store>,
    runner: Arc<SessionRunner>,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
    handles: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn Store>, runner: Arc<SessionRunner>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            runner,
            settings,
            shutdown: CancellationToken::new(),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let count = self.settings.worker_count.max(1);
        let mut handles = self.handles.lock();
        for worker_index in 0..count {
            let store = Arc::clone(&self.store);
            let runner = Arc::clone(&self.runner);
            let pod_id = self.settings.pod_id.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_index, store, runner, pod_id, shutdown).await;
            }));
        }
        tracing::info!(workers = count, pod_id = %self.settings.pod_id, "worker pool started");
    }

    /// Stop claiming new work; in-flight sessions run to their next
    /// stopping point.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_index: usize,
    store: Arc<dyn Store>,
    runner: Arc<SessionRunner>,
    pod_id: String,
    shutdown: CancellationToken,
) {
    let mut idle_rounds: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match store.claim_next_pending_session(&pod_id).await {
            Ok(Some(session)) => {
                idle_rounds = 0;
                tracing::info!(
                    worker = worker_index,
                    session_id = %session.session_id,
                    alert_type = %session.alert_type,
                    "claimed session"
                );
                runner.run(session, None).await;
            }
            Ok(None) => {
                idle_rounds = idle_rounds.saturating_add(1);
                let backoff = BACKOFF_STEP
                    .saturating_mul(idle_rounds)
                    .min(BACKOFF_CAP);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                tracing::warn!(worker = worker_index, error = %e, "claim failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(BACKOFF_CAP) => {}
                }
            }
        }
    }
}
