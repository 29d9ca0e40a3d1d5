//! Interaction sink — the hook contract the LLM and MCP clients emit into.
//!
//! The engine registers an implementation that persists the interaction row
//! and publishes a notification event. Sink calls are best-effort from the
//! emitter's point of view: a sink must never fail the operation that
//! triggered it.

use async_trait::async_trait;

use crate::interaction::{LlmInteraction, McpInteraction};
use crate::stage::StageExecution;

#[async_trait]
pub trait InteractionSink: Send + Sync {
    async fn on_llm_interaction(&self, interaction: LlmInteraction);
    async fn on_mcp_interaction(&self, interaction: McpInteraction);
    async fn on_stage_event(&self, stage: StageExecution);
}

/// Sink that drops everything. Useful in tests and one-off tooling.
pub struct NullSink;

#[async_trait]
impl InteractionSink for NullSink {
    async fn on_llm_interaction(&self, _interaction: LlmInteraction) {}
    async fn on_mcp_interaction(&self, _interaction: McpInteraction) {}
    async fn on_stage_event(&self, _stage: StageExecution) {}
}

/// Sink that records everything, for assertions in tests.
#[derive(Default)]
pub struct RecordingSink {
    pub llm: std::sync::Mutex<Vec<LlmInteraction>>,
    pub mcp: std::sync::Mutex<Vec<McpInteraction>>,
    pub stages: std::sync::Mutex<Vec<StageExecution>>,
}

#[async_trait]
impl InteractionSink for RecordingSink {
    async fn on_llm_interaction(&self, interaction: LlmInteraction) {
        self.llm.lock().unwrap().push(interaction);
    }

    async fn on_mcp_interaction(&self, interaction: McpInteraction) {
        self.mcp.lock().unwrap().push(interaction);
    }

    async fn on_stage_event(&self, stage: StageExecution) {
        self.stages.lock().unwrap().push(stage);
    }
}
