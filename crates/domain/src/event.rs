//! Typed event payloads and channel naming for the event bus.
//!
//! Events are lightweight notification triggers: a dashboard hears
//! `llm.interaction` on a session channel and refreshes via the REST API.
//! Every persisted event row gets a monotonically increasing `id` per
//! store, which is also the client-side dedup/catch-up key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{SessionStatus, StageStatus};
use crate::timestamp::now_us;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod channels {
    /// Global session lifecycle channel.
    pub const SESSIONS: &str = "sessions";
    /// Cross-replica cancel requests.
    pub const CANCELLATIONS: &str = "cancellations";

    /// Per-session detail channel.
    pub fn session_details(session_id: &str) -> String {
        format!("session:{session_id}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted event row: the durable copy used for catch-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub channel: String,
    pub payload: Value,
    pub created_at_us: i64,
}

/// An event as delivered to subscribers. `id` is `None` only for transient
/// events (streaming chunks) that are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub id: Option<i64>,
    pub channel: String,
    pub payload: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stream chunk classification for live LLM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Thought,
    FinalAnswer,
    NativeThinking,
    Summarization,
}

/// Grouping metadata threaded through streaming chunks so the UI can
/// attribute output to a parallel child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelMetadata {
    pub parent_stage_execution_id: String,
    pub parallel_index: i32,
    pub agent_name: String,
}

/// Every event the engine publishes, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String, alert_type: String },
    #[serde(rename = "session.started")]
    SessionStarted { session_id: String, pod_id: String },
    #[serde(rename = "session.completed")]
    SessionCompleted { session_id: String },
    #[serde(rename = "session.failed")]
    SessionFailed { session_id: String },
    #[serde(rename = "session.paused")]
    SessionPaused { session_id: String },
    #[serde(rename = "session.resumed")]
    SessionResumed { session_id: String },
    #[serde(rename = "session.cancelled")]
    SessionCancelled { session_id: String },
    #[serde(rename = "session.timed_out")]
    SessionTimedOut { session_id: String },
    #[serde(rename = "session.cancel_requested")]
    SessionCancelRequested { session_id: String },
    #[serde(rename = "stage.started")]
    StageStarted {
        session_id: String,
        execution_id: String,
        stage_id: String,
        stage_index: i32,
    },
    #[serde(rename = "stage.completed")]
    StageCompleted {
        session_id: String,
        execution_id: String,
        stage_id: String,
        status: StageStatus,
    },
    #[serde(rename = "llm.interaction")]
    LlmInteraction {
        session_id: String,
        interaction_id: String,
        stage_execution_id: Option<String>,
    },
    #[serde(rename = "mcp.tool_call")]
    McpToolCall {
        session_id: String,
        request_id: String,
        stage_execution_id: Option<String>,
    },
    /// Transient streaming chunk — dispatched but never persisted.
    #[serde(rename = "llm.stream.chunk")]
    LlmStreamChunk {
        session_id: String,
        stage_execution_id: Option<String>,
        stream_type: StreamType,
        /// Accumulated content so far, not a delta.
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parallel: Option<ParallelMetadata>,
    },
}

impl EventPayload {
    /// Serialize with the `timestamp_us` stamp every payload carries on
    /// the wire.
    pub fn to_value(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut v {
            map.insert("timestamp_us".into(), Value::from(now_us()));
        }
        v
    }

    /// True for payloads that must never reach the durable event log.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventPayload::LlmStreamChunk { .. })
    }

    /// Lifecycle payload for a terminal session status.
    pub fn for_terminal_status(session_id: &str, status: SessionStatus) -> Option<EventPayload> {
        let session_id = session_id.to_string();
        match status {
            SessionStatus::Completed => Some(EventPayload::SessionCompleted { session_id }),
            SessionStatus::Failed => Some(EventPayload::SessionFailed { session_id }),
            SessionStatus::Cancelled => Some(EventPayload::SessionCancelled { session_id }),
            SessionStatus::TimedOut => Some(EventPayload::SessionTimedOut { session_id }),
            _ => None,
        }
    }
}
