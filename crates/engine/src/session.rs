//! Session lifecycle operations behind the history API: cancel and resume.

use std::sync::Arc;

use tarsy_domain::config::Settings;
use tarsy_domain::error::Error;
use tarsy_domain::event::{channels, EventPayload};
use tarsy_domain::session::PauseMetadata;
use tarsy_domain::status::{SessionStatus, StageStatus};
use tarsy_domain::timestamp::now_us;
use tarsy_domain::Result;
use tarsy_events::EventBus;
use tarsy_store::Store;

use crate::cancel::CancellationTracker;
use crate::runner::SessionRunner;

pub struct SessionService {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    tracker: Arc<CancellationTracker>,
    runner: Arc<SessionRunner>,
    settings: Arc<Settings>,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        tracker: Arc<CancellationTracker>,
        runner: Arc<SessionRunner>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            bus,
            tracker,
            runner,
            settings,
        }
    }

    /// Handle a user cancel request for a session (and, from the API
    /// shape, one of its stages). Gated on the session being active.
    pub async fn request_cancel(&self, session_id: &str) -> Result<SessionStatus> {
        let (changed, status) = self.store.update_session_to_canceling(session_id).await?;
        if !changed {
            return Err(Error::Validation(format!(
                "session {session_id} is not active (status: {status})"
            )));
        }

        // A paused session has no running controller to unwind; it goes to
        // CANCELLED directly, clearing pause state.
        let session = self.store.get_session(session_id).await?;
        if let Some(mut session) = session {
            if session.pause_metadata.is_some() {
                session.pause_metadata = None;
                for stage in self
                    .store
                    .get_stage_executions_for_session(session_id)
                    .await?
                {
                    if stage.status == StageStatus::Paused {
                        let mut stage = stage;
                        stage.fail(StageStatus::Cancelled, "cancelled while paused");
                        self.store.update_stage_execution(&stage).await?;
                    }
                }
                session.finish(SessionStatus::Cancelled);
                self.store.update_session(&session).await?;
                self.publish(
                    channels::SESSIONS,
                    EventPayload::SessionCancelled {
                        session_id: session_id.to_string(),
                    },
                )
                .await;
                return Ok(SessionStatus::Cancelled);
            }
        }

        // Mark locally, then tell every replica; whichever owns the run
        // flips its in-process flag.
        self.tracker.mark_user_cancelled(session_id);
        self.tracker.cancel_local(session_id);
        self.publish(
            channels::CANCELLATIONS,
            EventPayload::SessionCancelRequested {
                session_id: session_id.to_string(),
            },
        )
        .await;

        tracing::info!(session_id, "cancel requested");
        Ok(SessionStatus::Canceling)
    }

    /// Resume a PAUSED session on this replica: rehydrate the captured
    /// conversation state and re-enter the chain executor.
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if session.status != SessionStatus::Paused {
            return Err(Error::Validation(format!(
                "session {session_id} is not paused (status: {})",
                session.status
            )));
        }
        let pause: PauseMetadata = session.pause_metadata.take().ok_or_else(|| {
            Error::Other(format!("paused session {session_id} has no pause metadata"))
        })?;

        session.status = SessionStatus::InProgress;
        session.pod_id = Some(self.settings.pod_id.clone());
        session.last_interaction_at_us = Some(now_us());
        self.store.update_session(&session).await?;

        self.publish(
            channels::SESSIONS,
            EventPayload::SessionResumed {
                session_id: session_id.to_string(),
            },
        )
        .await;
        tracing::info!(
            session_id,
            stage_id = pause.stage_id.as_deref().unwrap_or(""),
            "resuming paused session"
        );

        // Continue in the background; the resume endpoint returns as soon
        // as the session is back in flight.
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            runner.run(session, Some(pause)).await;
        });
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(e) = self.bus.publish(channel, &payload).await {
            tracing::warn!(channel, error = %e, "event publish failed");
        }
    }
}
