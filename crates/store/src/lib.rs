//! `tarsy-store` — typed persistence for sessions, stage executions,
//! interactions and events.
//!
//! One [`Store`] contract, two implementations:
//! - [`PgStore`]: sqlx/Postgres, the production store. Claims use
//!   `SELECT ... FOR UPDATE SKIP LOCKED` so replicas never double-claim.
//! - [`MemoryStore`]: a mutex-guarded in-process store with identical
//!   semantics, used by tests and database-less development.
//!
//! The racy write paths are atomic in both implementations:
//! `claim_next_pending_session` and `update_session_to_canceling` are single
//! round-trips on Postgres and single-lock sections in memory.

pub mod memory;
pub mod postgres;
pub mod retry;

use async_trait::async_trait;
use serde_json::Value;

use tarsy_domain::event::Event;
use tarsy_domain::interaction::{LlmInteraction, McpInteraction};
use tarsy_domain::session::AlertSession;
use tarsy_domain::stage::StageExecution;
use tarsy_domain::status::SessionStatus;
use tarsy_domain::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filters for the history listing API.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub agent_type: Option<String>,
    pub alert_type: Option<String>,
    /// Inclusive start of the `started_at_us` range.
    pub started_after_us: Option<i64>,
    /// Exclusive end of the `started_at_us` range.
    pub started_before_us: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl SessionFilter {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            50
        } else {
            self.limit.min(500)
        }
    }

    fn matches(&self, session: &AlertSession) -> bool {
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(agent_type) = &self.agent_type {
            if &session.agent_type != agent_type {
                return false;
            }
        }
        if let Some(alert_type) = &self.alert_type {
            if &session.alert_type != alert_type {
                return false;
            }
        }
        if let Some(after) = self.started_after_us {
            if session.started_at_us < after {
                return false;
            }
        }
        if let Some(before) = self.started_before_us {
            if session.started_at_us >= before {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait Store: Send + Sync {
    // Sessions ------------------------------------------------------

    /// Insert a new session. A duplicate `alert_id` yields
    /// [`tarsy_domain::Error::DuplicateAlert`].
    async fn create_session(&self, session: &AlertSession) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<AlertSession>>;

    /// Whole-row update. Rejects terminal statuses without
    /// `completed_at_us` (the store-side invariant check).
    async fn update_session(&self, session: &AlertSession) -> Result<()>;

    /// Atomically claim the oldest PENDING session for `pod_id`:
    /// status → IN_PROGRESS, pod stamped, heartbeat initialized.
    async fn claim_next_pending_session(&self, pod_id: &str) -> Result<Option<AlertSession>>;

    /// Update only `last_interaction_at_us` (the worker heartbeat); never
    /// touches any other column, so it cannot race a status transition.
    async fn touch_session(&self, session_id: &str, at_us: i64) -> Result<()>;

    async fn count_pending_sessions(&self) -> Result<u64>;

    async fn count_sessions_by_status(&self, status: SessionStatus) -> Result<u64>;

    /// Conditional transition to CANCELING, gated on the current status
    /// being active. Returns `(changed, status_after)`.
    async fn update_session_to_canceling(&self, session_id: &str)
        -> Result<(bool, SessionStatus)>;

    /// All sessions in an active status, for orphan detection.
    async fn get_active_sessions(&self) -> Result<Vec<AlertSession>>;

    /// History listing with filters; returns `(page, total_matching)`.
    async fn list_sessions(&self, filter: &SessionFilter) -> Result<(Vec<AlertSession>, u64)>;

    /// Retention sweep; cascades to stages and interactions.
    async fn delete_sessions_older_than(&self, cutoff_us: i64) -> Result<u64>;

    // Stage executions ----------------------------------------------

    async fn create_stage_execution(&self, stage: &StageExecution) -> Result<()>;

    async fn update_stage_execution(&self, stage: &StageExecution) -> Result<()>;

    async fn get_stage_execution(&self, execution_id: &str) -> Result<Option<StageExecution>>;

    async fn get_stage_executions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<StageExecution>>;

    // Interactions (append-only) ------------------------------------

    /// Idempotent on `interaction_id`: re-inserting the same id is a no-op.
    async fn create_llm_interaction(&self, interaction: &LlmInteraction) -> Result<()>;

    /// Idempotent on `request_id`.
    async fn create_mcp_interaction(&self, interaction: &McpInteraction) -> Result<()>;

    async fn get_llm_interactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<LlmInteraction>>;

    async fn get_mcp_interactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<McpInteraction>>;

    // Events --------------------------------------------------------

    /// Append an event row and return it with its assigned id.
    async fn create_event(&self, channel: &str, payload: Value) -> Result<Event>;

    /// Events on `channel` with id greater than `after_id`, ascending.
    async fn get_events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Highest event id currently on `channel` (0 when empty). The polling
    /// listener starts tailing from here.
    async fn latest_event_id(&self, channel: &str) -> Result<i64>;

    async fn delete_events_before(&self, cutoff_us: i64) -> Result<u64>;
}

/// Store-side invariant check shared by both implementations.
pub(crate) fn check_session_invariants(session: &AlertSession) -> Result<()> {
    if session.status.is_terminal() && session.completed_at_us.is_none() {
        return Err(tarsy_domain::Error::Validation(format!(
            "session {} moved to terminal status {} without completed_at_us",
            session.session_id, session.status
        )));
    }
    if (session.status == SessionStatus::Paused) != session.pause_metadata.is_some() {
        return Err(tarsy_domain::Error::Validation(format!(
            "session {} pause_metadata must be set iff status is paused (status: {})",
            session.session_id, session.status
        )));
    }
    Ok(())
}
