//! Background services: orphan recovery, history retention, the MCP
//! health monitor, and the cross-replica cancellations listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use tarsy_domain::config::{McpConfig, Settings};
use tarsy_domain::event::{channels, EventPayload};
use tarsy_domain::sink::NullSink;
use tarsy_domain::status::SessionStatus;
use tarsy_domain::timestamp::now_us;
use tarsy_domain::Result;
use tarsy_events::EventBus;
use tarsy_mcp::{McpClient, McpRecoveryConfig};
use tarsy_store::Store;

use crate::cancel::CancellationTracker;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orphan sweeper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fails sessions whose owning replica died: IN_PROGRESS or CANCELING
/// with a heartbeat older than the orphan threshold.
pub struct OrphanSweeper {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    timeout: Duration,
    check_interval: Duration,
    shutdown: CancellationToken,
}

impl OrphanSweeper {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, settings: &Settings) -> Self {
        Self {
            store,
            bus,
            timeout: Duration::from_secs(settings.orphan_timeout_minutes * 60),
            check_interval: Duration::from_secs(settings.orphan_check_interval_minutes * 60),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(sweeper.check_interval) => {}
                }
                if let Err(e) = sweeper.sweep().await {
                    tracing::error!(error = %e, "orphan sweep failed");
                }
            }
        });
        tracing::info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.check_interval.as_secs(),
            "orphan sweeper started"
        );
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// One pass: returns how many sessions were orphan-failed.
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff_us = now_us() - self.timeout.as_micros() as i64;
        let mut orphaned = 0;

        for mut session in self.store.get_active_sessions().await? {
            let claimable = matches!(
                session.status,
                SessionStatus::InProgress | SessionStatus::Canceling
            );
            let stale = session
                .last_interaction_at_us
                .map_or(false, |at| at < cutoff_us);
            if !claimable || !stale {
                continue;
            }

            tracing::warn!(
                session_id = %session.session_id,
                pod_id = session.pod_id.as_deref().unwrap_or(""),
                last_interaction_at_us = session.last_interaction_at_us.unwrap_or(0),
                "orphaned session detected, marking failed"
            );
            session.error_message = Some(format!(
                "orphaned: no heartbeat for over {} minutes (owning pod presumed dead)",
                self.timeout.as_secs() / 60
            ));
            session.finish(SessionStatus::Failed);
            self.store.update_session(&session).await?;
            let _ = self
                .bus
                .publish(
                    channels::SESSIONS,
                    &EventPayload::SessionFailed {
                        session_id: session.session_id.clone(),
                    },
                )
                .await;
            orphaned += 1;
        }
        Ok(orphaned)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History retention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deletes sessions (cascading to stages and interactions) older than the
/// configured retention.
pub struct HistoryRetentionService {
    store: Arc<dyn Store>,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HistoryRetentionService {
    pub fn new(store: Arc<dyn Store>, settings: &Settings) -> Self {
        Self {
            store,
            retention: Duration::from_secs(settings.history_retention_days * 24 * 3600),
            interval: Duration::from_secs(settings.history_cleanup_interval_hours * 3600),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(service.interval) => {}
                }
                match service.sweep().await {
                    Ok(0) => tracing::debug!("no expired sessions"),
                    Ok(deleted) => tracing::info!(deleted, "history retention sweep"),
                    Err(e) => tracing::error!(error = %e, "history retention sweep failed"),
                }
            }
        });
        tracing::info!(
            retention_days = self.retention.as_secs() / 86_400,
            "history retention service started"
        );
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn sweep(&self) -> Result<u64> {
        let cutoff_us = now_us() - self.retention.as_micros() as i64;
        self.store.delete_sessions_older_than(cutoff_us).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP health monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, serde::Serialize)]
pub struct McpServerSnapshot {
    pub name: String,
    pub available: bool,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at_us: i64,
}

/// Probes every configured MCP server periodically and caches the tool
/// registry snapshot for the system API. Until the first probe finishes
/// (~the first 15s), callers fall back to a live probe.
pub struct McpHealthMonitor {
    config: Arc<McpConfig>,
    recovery: McpRecoveryConfig,
    interval: Duration,
    cache: RwLock<Vec<McpServerSnapshot>>,
    ready: AtomicBool,
    shutdown: CancellationToken,
}

impl McpHealthMonitor {
    pub fn new(config: Arc<McpConfig>, recovery: McpRecoveryConfig, interval: Duration) -> Self {
        Self {
            config,
            recovery,
            interval,
            cache: RwLock::new(Vec::new()),
            ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let snapshots = monitor.probe().await;
                *monitor.cache.write() = snapshots;
                monitor.ready.store(true, Ordering::Release);
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(monitor.interval) => {}
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Cached snapshot, or `None` before the first probe completed.
    pub fn snapshot(&self) -> Option<Vec<McpServerSnapshot>> {
        if self.ready.load(Ordering::Acquire) {
            Some(self.cache.read().clone())
        } else {
            None
        }
    }

    /// Probe all servers now (the live fallback during startup).
    pub async fn probe(&self) -> Vec<McpServerSnapshot> {
        let mut snapshots = Vec::new();
        let client = McpClient::new(
            "mcp-health-monitor",
            Arc::clone(&self.config),
            None,
            self.recovery.clone(),
            Arc::new(NullSink),
        );
        for server in &self.config.servers {
            let snapshot = match client.list_tools(&server.name, None).await {
                Ok(tools) => McpServerSnapshot {
                    name: server.name.clone(),
                    available: true,
                    tools: tools.into_iter().map(|t| t.name).collect(),
                    error: None,
                    checked_at_us: now_us(),
                },
                Err(e) => McpServerSnapshot {
                    name: server.name.clone(),
                    available: false,
                    tools: Vec::new(),
                    error: Some(e.to_string()),
                    checked_at_us: now_us(),
                },
            };
            snapshots.push(snapshot);
        }
        if let Err(e) = client.close().await {
            tracing::debug!(error = %e, "health monitor client teardown");
        }
        snapshots
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellations listener
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Listen for cross-replica cancel requests and flip the local flag when
/// this replica owns the run. Every relayed event is a user cancel by
/// construction, so the tracker gets the mark too.
pub fn spawn_cancellation_listener(
    bus: Arc<dyn EventBus>,
    tracker: Arc<CancellationTracker>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe(channels::CANCELLATIONS).await;
        while let Some(event) = subscription.recv().await {
            if event.payload["type"] != "session.cancel_requested" {
                continue;
            }
            let Some(session_id) = event.payload["session_id"].as_str() else {
                continue;
            };
            tracker.mark_user_cancelled(session_id);
            if tracker.cancel_local(session_id) {
                tracing::info!(session_id, "cancelled locally running session via relay");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_domain::alert::Alert;
    use tarsy_domain::session::AlertSession;
    use tarsy_events::PollingEventBus;
    use tarsy_store::MemoryStore;

    fn session(store_now: i64, status: SessionStatus) -> AlertSession {
        let alert = Alert {
            alert_type: "kubernetes".into(),
            runbook: None,
            severity: None,
            timestamp: None,
            data: serde_json::json!({}),
            mcp: None,
        };
        let mut session = AlertSession::pending(
            &alert,
            format!("a-{store_now}-{}", tarsy_domain::timestamp::new_id()),
            "c",
            serde_json::json!({}),
            "tester",
        );
        session.status = status;
        session.last_interaction_at_us = Some(store_now);
        session
    }

    fn sweeper(store: Arc<MemoryStore>, bus: Arc<PollingEventBus>) -> OrphanSweeper {
        let mut settings = Settings::default();
        settings.orphan_timeout_minutes = 30;
        OrphanSweeper::new(store, bus, &settings)
    }

    #[tokio::test]
    async fn stale_in_progress_session_is_orphan_failed() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(PollingEventBus::new(
            store.clone() as Arc<dyn Store>,
            Duration::from_millis(20),
        ));

        let hour_ago = now_us() - 3_600 * 1_000_000;
        let stale = session(hour_ago, SessionStatus::InProgress);
        let fresh = session(now_us(), SessionStatus::InProgress);
        let pending = session(hour_ago, SessionStatus::Pending);
        store.create_session(&stale).await.unwrap();
        store.create_session(&fresh).await.unwrap();
        store.create_session(&pending).await.unwrap();

        let orphaned = sweeper(store.clone(), bus).sweep().await.unwrap();
        assert_eq!(orphaned, 1);

        let updated = store.get_session(&stale.session_id).await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Failed);
        assert!(updated.error_message.unwrap().contains("orphaned"));
        assert!(updated.completed_at_us.is_some());

        // Fresh and pending sessions untouched.
        let fresh = store.get_session(&fresh.session_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, SessionStatus::InProgress);
        let pending = store.get_session(&pending.session_id).await.unwrap().unwrap();
        assert_eq!(pending.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn retention_sweep_deletes_expired_sessions() {
        let store = Arc::new(MemoryStore::new());
        let mut old = session(0, SessionStatus::Completed);
        old.started_at_us = now_us() - 100 * 24 * 3_600 * 1_000_000;
        old.completed_at_us = Some(old.started_at_us);
        store.create_session(&old).await.unwrap();
        store
            .create_session(&session(now_us(), SessionStatus::Pending))
            .await
            .unwrap();

        let service = HistoryRetentionService::new(store.clone(), &Settings::default());
        assert_eq!(service.sweep().await.unwrap(), 1);
        assert_eq!(service.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_listener_marks_and_flips() {
        let store = Arc::new(MemoryStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(PollingEventBus::new(
            store.clone() as Arc<dyn Store>,
            Duration::from_millis(20),
        ));
        let tracker = Arc::new(CancellationTracker::new());
        let token = tracker.register("s1");

        let handle = spawn_cancellation_listener(Arc::clone(&bus), Arc::clone(&tracker));
        // Give the listener a beat to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish(
            channels::CANCELLATIONS,
            &EventPayload::SessionCancelRequested {
                session_id: "s1".into(),
            },
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !token.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relayed cancel should flip the token");
        assert!(tracker.is_user_cancel("s1"));
        handle.abort();
    }
}
