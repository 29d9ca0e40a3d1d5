//! Synthesis controller: one tool-less call over prior stage outputs.
//!
//! Used after parallel investigation stages to produce a unified analysis,
//! and by the SummaryAgent. The native-thinking variant enables the
//! provider's reasoning mode for deeper synthesis.

use async_trait::async_trait;

use tarsy_domain::conversation::Message;
use tarsy_domain::event::StreamType;
use tarsy_llm::LlmRequest;

use crate::context::StageContext;
use crate::controller::IterationController;
use crate::prompts;
use crate::AgentResult;

pub struct SynthesisController {
    native_thinking: bool,
}

impl SynthesisController {
    pub fn plain() -> Self {
        Self {
            native_thinking: false,
        }
    }

    pub fn native_thinking() -> Self {
        Self {
            native_thinking: true,
        }
    }
}

#[async_trait]
impl IterationController for SynthesisController {
    fn needs_mcp_tools(&self) -> bool {
        false
    }

    async fn execute_analysis_loop(&self, ctx: &mut StageContext) -> AgentResult<String> {
        ctx.check_cancelled()?;
        ctx.current_iteration = 1;

        let conversation = [
            Message::system(prompts::build_system_prompt(ctx, &[], false)),
            Message::user(prompts::build_synthesis_prompt(ctx)),
        ]
        .into_iter()
        .collect();

        let mut request = LlmRequest::investigation(&ctx.session_id, conversation);
        request.stage_execution_id = Some(ctx.execution_id.clone());
        request.provider = ctx.config.llm_provider.clone();
        request.thinking = self.native_thinking;
        request.parallel = ctx.parallel.clone();
        request.stream_type = if self.native_thinking {
            StreamType::NativeThinking
        } else {
            StreamType::FinalAnswer
        };
        request.step_description = "synthesis".into();

        let updated = ctx.llm.generate_response(request).await?;
        Ok(updated
            .latest_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}
