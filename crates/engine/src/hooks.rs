//! Hook fan-out: persist every interaction, publish the matching
//! notification event.
//!
//! Best-effort by contract: a persistence failure gets one retry, an event
//! publish failure is logged. Neither ever fails the LLM/MCP operation
//! that triggered the hook.

use std::sync::Arc;

use async_trait::async_trait;

use tarsy_domain::event::{channels, EventPayload};
use tarsy_domain::interaction::{LlmInteraction, McpInteraction};
use tarsy_domain::sink::InteractionSink;
use tarsy_domain::stage::StageExecution;
use tarsy_domain::status::StageStatus;
use tarsy_events::EventBus;
use tarsy_store::Store;

pub struct EngineHooks {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
}

impl EngineHooks {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    async fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(e) = self.bus.publish(channel, &payload).await {
            tracing::warn!(channel, error = %e, "event publish failed (hook is best-effort)");
        }
    }
}

#[async_trait]
impl InteractionSink for EngineHooks {
    async fn on_llm_interaction(&self, interaction: LlmInteraction) {
        // Insert is idempotent on interaction_id, so a retry can never
        // duplicate the row.
        if let Err(first) = self.store.create_llm_interaction(&interaction).await {
            tracing::warn!(
                interaction_id = %interaction.interaction_id,
                error = %first,
                "LLM interaction persist failed, retrying once"
            );
            if let Err(second) = self.store.create_llm_interaction(&interaction).await {
                tracing::error!(
                    interaction_id = %interaction.interaction_id,
                    error = %second,
                    "LLM interaction lost after retry"
                );
                return;
            }
        }

        self.publish(
            &channels::session_details(&interaction.session_id),
            EventPayload::LlmInteraction {
                session_id: interaction.session_id.clone(),
                interaction_id: interaction.interaction_id.clone(),
                stage_execution_id: interaction.stage_execution_id.clone(),
            },
        )
        .await;
    }

    async fn on_mcp_interaction(&self, interaction: McpInteraction) {
        if let Err(first) = self.store.create_mcp_interaction(&interaction).await {
            tracing::warn!(
                request_id = %interaction.request_id,
                error = %first,
                "MCP interaction persist failed, retrying once"
            );
            if let Err(second) = self.store.create_mcp_interaction(&interaction).await {
                tracing::error!(
                    request_id = %interaction.request_id,
                    error = %second,
                    "MCP interaction lost after retry"
                );
                return;
            }
        }

        self.publish(
            &channels::session_details(&interaction.session_id),
            EventPayload::McpToolCall {
                session_id: interaction.session_id.clone(),
                request_id: interaction.request_id.clone(),
                stage_execution_id: interaction.stage_execution_id.clone(),
            },
        )
        .await;
    }

    async fn on_stage_event(&self, stage: StageExecution) {
        // Stage rows are persisted by the executor (create/update
        // semantics); the hook's job is the notification.
        let payload = match stage.status {
            StageStatus::Active => EventPayload::StageStarted {
                session_id: stage.session_id.clone(),
                execution_id: stage.execution_id.clone(),
                stage_id: stage.stage_id.clone(),
                stage_index: stage.stage_index,
            },
            status if status.is_terminal() => EventPayload::StageCompleted {
                session_id: stage.session_id.clone(),
                execution_id: stage.execution_id.clone(),
                stage_id: stage.stage_id.clone(),
                status,
            },
            // Pending/paused transitions ride the session-level events.
            _ => return,
        };
        self.publish(&channels::session_details(&stage.session_id), payload)
            .await;
    }
}
