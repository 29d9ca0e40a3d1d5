//! Session runner: one claimed session from start (or resume) to the
//! point it leaves this replica, with the heartbeat alive throughout.

use std::sync::Arc;
use std::time::Duration;

use tarsy_domain::session::{AlertSession, PauseMetadata};
use tarsy_domain::status::SessionStatus;
use tarsy_domain::timestamp::now_us;
use tarsy_store::Store;

use crate::cancel::CancellationTracker;
use crate::executor::ChainExecutor;

pub struct SessionRunner {
    executor: Arc<ChainExecutor>,
    store: Arc<dyn Store>,
    tracker: Arc<CancellationTracker>,
    heartbeat_interval: Duration,
}

impl SessionRunner {
    pub fn new(
        executor: Arc<ChainExecutor>,
        store: Arc<dyn Store>,
        tracker: Arc<CancellationTracker>,
        heartbeat_secs: u64,
    ) -> Self {
        Self {
            executor,
            store,
            tracker,
            heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
        }
    }

    /// Run one session. Errors are terminal-state handling failures; the
    /// executor itself maps agent outcomes to statuses internally.
    pub async fn run(&self, session: AlertSession, resume: Option<PauseMetadata>) {
        let session_id = session.session_id.clone();

        // Heartbeat while the executor works, so the orphan sweeper can
        // tell a live run from a dead replica's leftovers.
        let heartbeat_store = Arc::clone(&self.store);
        let heartbeat_id = session_id.clone();
        let interval = self.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = heartbeat_store.touch_session(&heartbeat_id, now_us()).await {
                    tracing::debug!(session_id = %heartbeat_id, error = %e, "heartbeat failed");
                }
            }
        });

        let result = self.executor.execute_session(session, resume).await;
        heartbeat.abort();

        if let Err(e) = result {
            tracing::error!(session_id = %session_id, error = %e, "session execution failed to settle");
            // Last-resort: never leave the session IN_PROGRESS.
            if let Ok(Some(mut session)) = self.store.get_session(&session_id).await {
                if session.status.is_active() {
                    session.error_message = Some(format!("execution error: {e}"));
                    session.finish(SessionStatus::Failed);
                    if let Err(e) = self.store.update_session(&session).await {
                        tracing::error!(session_id = %session_id, error = %e, "failed to mark session FAILED");
                    }
                }
            }
            self.tracker.remove(&session_id);
            self.tracker.clear(&session_id);
        }
    }
}
