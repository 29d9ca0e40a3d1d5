//! Chain and stage context passed through the controllers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use tarsy_domain::cancel::CancelToken;
use tarsy_domain::config::ExecutionConfig;
use tarsy_domain::conversation::Conversation;
use tarsy_domain::event::ParallelMetadata;
use tarsy_domain::session::AlertSession;
use tarsy_llm::LlmClient;
use tarsy_mcp::{McpClient, McpTool};

use crate::{AgentDefinition, AgentError, AgentResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulated context across a chain run: the alert plus every finished
/// stage's output.
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    pub session_id: String,
    pub alert_type: String,
    pub alert_data: Value,
    pub runbook_url: Option<String>,
    pub author: String,
    /// Stage results under both their stage-name key and their
    /// execution-id key. The execution id is the authoritative handle
    /// (stage names are ambiguous for parallel peers); the name key exists
    /// for prompt building and source compatibility.
    results: HashMap<String, Value>,
    /// Stage-name keys in completion order, for prompt assembly.
    completed_stages: Vec<String>,
}

impl ChainContext {
    pub fn for_session(session: &AlertSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            alert_type: session.alert_type.clone(),
            alert_data: session.alert_data.clone(),
            runbook_url: session.runbook_url.clone(),
            author: session.author.clone(),
            results: HashMap::new(),
            completed_stages: Vec::new(),
        }
    }

    /// Record a stage result under both keys.
    pub fn add_stage_result(&mut self, stage_name: &str, execution_id: &str, output: Value) {
        self.results.insert(stage_name.to_string(), output.clone());
        self.results.insert(execution_id.to_string(), output);
        if !self.completed_stages.iter().any(|s| s == stage_name) {
            self.completed_stages.push(stage_name.to_string());
        }
    }

    pub fn result_by_execution_id(&self, execution_id: &str) -> Option<&Value> {
        self.results.get(execution_id)
    }

    /// `(stage_name, output)` pairs in completion order.
    pub fn ordered_results(&self) -> Vec<(&str, &Value)> {
        self.completed_stages
            .iter()
            .filter_map(|name| self.results.get(name).map(|v| (name.as_str(), v)))
            .collect()
    }

    pub fn has_results(&self) -> bool {
        !self.completed_stages.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a controller needs to run one stage.
pub struct StageContext {
    pub session_id: String,
    pub execution_id: String,
    pub stage_id: String,
    pub stage_name: String,
    pub agent: AgentDefinition,
    pub config: ExecutionConfig,
    pub chain: ChainContext,
    /// `(server, tool)` pairs fetched for this stage.
    pub available_tools: Vec<(String, McpTool)>,
    pub llm: Arc<LlmClient>,
    pub mcp: Arc<McpClient>,
    pub cancel: CancelToken,
    pub parallel: Option<ParallelMetadata>,
    /// Set on resume: the conversation captured at pause time.
    pub resume_conversation: Option<Conversation>,
    pub resume_iteration: Option<u32>,
    /// Updated by the controller as the loop advances; read back by the
    /// executor for the stage row and pause metadata.
    pub current_iteration: u32,
}

impl StageContext {
    /// Cooperative cancellation check, used between LLM and tool calls.
    pub fn check_cancelled(&self) -> AgentResult<()> {
        if self.cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Tool-result token budget of the stage's LLM provider.
    pub fn max_result_tokens(&self) -> Option<u32> {
        self.llm
            .registry()
            .max_tool_result_tokens(self.config.llm_provider.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_results_written_under_both_keys() {
        let mut chain = ChainContext::default();
        let output = serde_json::json!({"analysis": "ok"});
        chain.add_stage_result("initial-analysis", "exec-1", output.clone());

        assert_eq!(chain.result_by_execution_id("exec-1"), Some(&output));
        let ordered = chain.ordered_results();
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].0, "initial-analysis");
    }

    #[test]
    fn parallel_peers_keep_distinct_execution_keys() {
        let mut chain = ChainContext::default();
        chain.add_stage_result("investigate", "exec-a", serde_json::json!({"agent": "a"}));
        chain.add_stage_result("investigate", "exec-b", serde_json::json!({"agent": "b"}));

        // The name key is last-writer-wins (ambiguous by design); the
        // execution-id keys stay distinct.
        assert_eq!(
            chain.result_by_execution_id("exec-a").unwrap()["agent"],
            "a"
        );
        assert_eq!(
            chain.result_by_execution_id("exec-b").unwrap()["agent"],
            "b"
        );
        assert_eq!(chain.ordered_results().len(), 1);
    }
}
