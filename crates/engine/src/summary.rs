//! LLM-backed summarization: oversized MCP observations and the
//! post-chain executive summary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tarsy_domain::conversation::{Conversation, Message};
use tarsy_domain::error::Error;
use tarsy_domain::event::StreamType;
use tarsy_domain::interaction::InteractionType;
use tarsy_domain::Result;
use tarsy_llm::{LlmClient, LlmRequest};
use tarsy_mcp::{ResultSummarizer, SummarizationRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP observation summarizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compresses an oversized tool observation with the investigation
/// conversation as context; the recorded interaction links back to the
/// tool call via `mcp_event_id`.
pub struct LlmResultSummarizer {
    llm: Arc<LlmClient>,
    provider: Option<String>,
}

impl LlmResultSummarizer {
    pub fn new(llm: Arc<LlmClient>, provider: Option<String>) -> Self {
        Self { llm, provider }
    }
}

#[async_trait]
impl ResultSummarizer for LlmResultSummarizer {
    async fn summarize(&self, request: SummarizationRequest) -> Result<String> {
        let investigation_context = request
            .conversation
            .latest_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let conversation: Conversation = [
            Message::system(
                "You compress tool output for an ongoing incident investigation. Keep \
                 every observation that could matter for diagnosis: errors, counts, \
                 names, timestamps. Drop boilerplate.",
            ),
            Message::user(format!(
                "Investigation context:\n{investigation_context}\n\nOutput of `{}.{}`:\n{}\n\nSummarize the output.",
                request.server_name, request.tool_name, request.result_text
            )),
        ]
        .into_iter()
        .collect();

        let mut llm_request = LlmRequest::investigation(&request.session_id, conversation);
        llm_request.stage_execution_id = request.stage_execution_id.clone();
        llm_request.provider = self.provider.clone();
        llm_request.interaction_type = InteractionType::Summarization;
        llm_request.mcp_event_id = Some(request.mcp_event_id.clone());
        llm_request.stream_type = StreamType::Summarization;
        llm_request.step_description = format!(
            "summarize {}.{} result",
            request.server_name, request.tool_name
        );

        let updated = self.llm.generate_response(llm_request).await?;
        updated
            .latest_assistant()
            .map(|m| m.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Other("summarizer returned empty content".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executive summary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded post-chain summary for external notifications. Has its own
/// timeout; a failure here never fails the session.
pub struct ExecutiveSummarizer {
    llm: Arc<LlmClient>,
    max_tokens: u32,
    timeout: Duration,
}

impl ExecutiveSummarizer {
    pub fn new(llm: Arc<LlmClient>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            llm,
            max_tokens,
            timeout,
        }
    }

    pub async fn summarize(&self, session_id: &str, final_analysis: &str) -> Result<String> {
        let conversation: Conversation = [
            Message::system("You write terse executive incident summaries."),
            Message::user(tarsy_agents::prompts::build_executive_summary_prompt(
                final_analysis,
                self.max_tokens,
            )),
        ]
        .into_iter()
        .collect();

        let mut request = LlmRequest::investigation(session_id, conversation);
        request.interaction_type = InteractionType::FinalAnalysisSummary;
        request.max_tokens = Some(self.max_tokens);
        request.stream_type = StreamType::Summarization;
        request.step_description = "executive summary".into();

        let result = tokio::time::timeout(self.timeout, self.llm.generate_response(request))
            .await
            .map_err(|_| Error::Timeout("executive summary".into()))??;

        result
            .latest_assistant()
            .map(|m| m.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| Error::Other("executive summary returned empty content".into()))
    }
}
