//! LLM and MCP interaction records — the append-only audit trail.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::Conversation;
use crate::timestamp::{new_id, now_us};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM interactions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Investigation,
    Summarization,
    FinalAnalysisSummary,
    ToolSelection,
    /// Promoted from `Investigation` when the assistant message opens with
    /// `Final Answer:`.
    FinalAnswer,
}

/// One chat completion (or streamed completion) with a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmInteraction {
    pub interaction_id: String,
    pub session_id: String,
    /// Null for post-chain work such as the executive summary.
    #[serde(default)]
    pub stage_execution_id: Option<String>,
    pub timestamp_us: i64,
    pub conversation: Conversation,
    pub model_name: String,
    pub provider: String,
    pub interaction_type: InteractionType,
    /// Provider-specific extras: token usage, finish reason, grounding.
    #[serde(default)]
    pub response_metadata: Option<Value>,
    #[serde(default)]
    pub native_tools_config: Option<Value>,
    #[serde(default)]
    pub thinking_content: Option<String>,
    /// For summarization interactions, the MCP request whose output was
    /// summarized.
    #[serde(default)]
    pub mcp_event_id: Option<String>,
    pub duration_ms: i64,
    pub step_description: String,
}

impl LlmInteraction {
    pub fn new(session_id: impl Into<String>, conversation: Conversation) -> Self {
        Self {
            interaction_id: new_id(),
            session_id: session_id.into(),
            stage_execution_id: None,
            timestamp_us: now_us(),
            conversation,
            model_name: String::new(),
            provider: String::new(),
            interaction_type: InteractionType::Investigation,
            response_metadata: None,
            native_tools_config: None,
            thinking_content: None,
            mcp_event_id: None,
            duration_ms: 0,
            step_description: String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP interactions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpCommunicationType {
    ToolList,
    ToolCall,
    Result,
}

/// One tool list or tool call against an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpInteraction {
    pub request_id: String,
    pub session_id: String,
    #[serde(default)]
    pub stage_execution_id: Option<String>,
    pub timestamp_us: i64,
    pub server_name: String,
    pub communication_type: McpCommunicationType,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_arguments: Option<Value>,
    #[serde(default)]
    pub tool_result: Option<Value>,
    /// Discovered tool list (for `tool_list` interactions).
    #[serde(default)]
    pub available_tools: Option<Value>,
    pub duration_ms: i64,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl McpInteraction {
    pub fn new(
        session_id: impl Into<String>,
        server_name: impl Into<String>,
        communication_type: McpCommunicationType,
    ) -> Self {
        Self {
            request_id: new_id(),
            session_id: session_id.into(),
            stage_execution_id: None,
            timestamp_us: now_us(),
            server_name: server_name.into(),
            communication_type,
            tool_name: None,
            tool_arguments: None,
            tool_result: None,
            available_tools: None,
            duration_ms: 0,
            success: false,
            error_message: None,
        }
    }
}
