//! Alert session record — one alert processing run, from ingestion to a
//! terminal status.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alert::{Alert, McpSelection};
use crate::conversation::Conversation;
use crate::status::SessionStatus;
use crate::timestamp::{new_id, now_us};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pause metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    MaxIterationsReached,
}

/// Why and where a session paused, plus the captured conversation state.
///
/// The `conversations` map is keyed by stage `execution_id` so parallel
/// children pause and resume independently (stage names are ambiguous for
/// parallel peers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseMetadata {
    pub reason: PauseReason,
    pub message: String,
    #[serde(default)]
    pub current_iteration: Option<u32>,
    pub paused_at_us: i64,
    #[serde(default)]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub conversations: HashMap<String, Conversation>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alert session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One alert processing run.
///
/// Invariants (enforced by the store on update):
/// - `completed_at_us` is set iff `status` is terminal.
/// - `pause_metadata` is non-null iff `status` is `paused`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSession {
    pub session_id: String,
    /// External alert identifier; unique across sessions.
    pub alert_id: String,
    pub alert_type: String,
    /// Processing agent type, `"chain:<chain_id>"` for chain execution.
    pub agent_type: String,
    pub alert_data: Value,
    pub chain_id: String,
    /// Snapshot of the chain definition at ingestion time.
    pub chain_definition: Value,
    pub author: String,
    #[serde(default)]
    pub runbook_url: Option<String>,
    #[serde(default)]
    pub mcp_selection: Option<McpSelection>,
    pub status: SessionStatus,
    /// Replica that owns this session while it runs.
    #[serde(default)]
    pub pod_id: Option<String>,
    /// Liveness heartbeat for orphan detection.
    #[serde(default)]
    pub last_interaction_at_us: Option<i64>,
    pub started_at_us: i64,
    #[serde(default)]
    pub completed_at_us: Option<i64>,
    #[serde(default)]
    pub current_stage_index: Option<i32>,
    #[serde(default)]
    pub current_stage_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub final_analysis: Option<String>,
    #[serde(default)]
    pub final_analysis_summary: Option<String>,
    #[serde(default)]
    pub executive_summary_error: Option<String>,
    #[serde(default)]
    pub pause_metadata: Option<PauseMetadata>,
}

impl AlertSession {
    /// Build a fresh PENDING session for a validated alert.
    pub fn pending(
        alert: &Alert,
        alert_id: impl Into<String>,
        chain_id: impl Into<String>,
        chain_definition: Value,
        author: impl Into<String>,
    ) -> Self {
        let chain_id = chain_id.into();
        Self {
            session_id: new_id(),
            alert_id: alert_id.into(),
            alert_type: alert.alert_type.clone(),
            agent_type: format!("chain:{chain_id}"),
            alert_data: alert.data.clone(),
            chain_id,
            chain_definition,
            author: author.into(),
            runbook_url: alert.runbook.clone(),
            mcp_selection: alert.mcp.clone(),
            status: SessionStatus::Pending,
            pod_id: None,
            last_interaction_at_us: None,
            started_at_us: now_us(),
            completed_at_us: None,
            current_stage_index: None,
            current_stage_id: None,
            error_message: None,
            final_analysis: None,
            final_analysis_summary: None,
            executive_summary_error: None,
            pause_metadata: None,
        }
    }

    /// Move to a terminal status, stamping `completed_at_us`.
    pub fn finish(&mut self, status: SessionStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at_us = Some(now_us());
        self.pause_metadata = None;
    }
}
