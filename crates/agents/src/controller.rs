//! The iteration-controller contract and strategy dispatch.

use async_trait::async_trait;

use tarsy_domain::chain::IterationStrategy;

use crate::context::StageContext;
use crate::native::NativeThinkingController;
use crate::react::ReactController;
use crate::synthesis::SynthesisController;
use crate::AgentResult;

/// Drives one stage's reasoning loop.
#[async_trait]
pub trait IterationController: Send + Sync {
    /// Run the loop to completion, returning the stage's final analysis
    /// text. Pause and cancellation surface as [`crate::AgentError`]
    /// variants.
    async fn execute_analysis_loop(&self, ctx: &mut StageContext) -> AgentResult<String>;

    /// Whether the executor should fetch MCP tools before running this
    /// controller.
    fn needs_mcp_tools(&self) -> bool;
}

/// Controller for a resolved iteration strategy.
pub fn controller_for(strategy: IterationStrategy) -> Box<dyn IterationController> {
    match strategy {
        IterationStrategy::React => Box::new(ReactController),
        IterationStrategy::NativeThinking => Box::new(NativeThinkingController),
        IterationStrategy::Synthesis => Box::new(SynthesisController::plain()),
        IterationStrategy::SynthesisNativeThinking => {
            Box::new(SynthesisController::native_thinking())
        }
    }
}
