//! `tarsy-agents` — agent definitions and the iteration controllers that
//! drive one stage's reasoning loop.
//!
//! An agent is a named unit: iteration strategy + default MCP servers +
//! optional custom instructions. A controller runs the stage loop against
//! the LLM and MCP clients carried by the [`context::StageContext`]:
//! - [`react::ReactController`] — Thought/Action/Observation turns.
//! - [`native::NativeThinkingController`] — provider-native reasoning with
//!   native tool calls.
//! - [`synthesis::SynthesisController`] — one tool-less call over prior
//!   stage outputs.
//!
//! Pause and cancellation are control-flow results ([`AgentError`]), not
//! failures; the chain executor maps them to stage/session statuses.

pub mod context;
pub mod controller;
pub mod native;
pub mod prompts;
pub mod react;
pub mod synthesis;

use tarsy_domain::chain::IterationStrategy;
use tarsy_domain::config::AgentConfig;
use tarsy_domain::conversation::Conversation;

pub use context::{ChainContext, StageContext};
pub use controller::{controller_for, IterationController};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub mcp_servers: Vec<String>,
    pub custom_instructions: Option<String>,
    pub iteration_strategy: IterationStrategy,
}

impl AgentDefinition {
    pub fn from_config(name: &str, config: &AgentConfig) -> Self {
        Self {
            name: name.to_string(),
            mcp_servers: config.mcp_servers.clone(),
            custom_instructions: config.custom_instructions.clone(),
            iteration_strategy: config.iteration_strategy.unwrap_or_default(),
        }
    }
}

/// Agent classes that ship with the engine.
pub fn builtin_agent(name: &str) -> Option<AgentDefinition> {
    match name {
        "KubernetesAgent" => Some(AgentDefinition {
            name: name.to_string(),
            mcp_servers: vec!["kubernetes".to_string()],
            custom_instructions: None,
            iteration_strategy: IterationStrategy::React,
        }),
        "SynthesisAgent" => Some(AgentDefinition {
            name: name.to_string(),
            mcp_servers: Vec::new(),
            custom_instructions: None,
            iteration_strategy: IterationStrategy::Synthesis,
        }),
        "SummaryAgent" => Some(AgentDefinition {
            name: name.to_string(),
            mcp_servers: Vec::new(),
            custom_instructions: None,
            iteration_strategy: IterationStrategy::Synthesis,
        }),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control-flow results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conversation state captured when a stage pauses mid-loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseCapture {
    pub conversation: Conversation,
    pub current_iteration: u32,
}

/// How a controller loop ends, other than success. `Paused` and
/// `Cancelled` are control flow — the executor must never record them as
/// stage failures.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("stage paused at iteration {}", .0.current_iteration)]
    Paused(PauseCapture),

    #[error("stage cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] tarsy_domain::Error),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_agents_resolve() {
        let k8s = builtin_agent("KubernetesAgent").unwrap();
        assert_eq!(k8s.mcp_servers, ["kubernetes"]);
        assert_eq!(k8s.iteration_strategy, IterationStrategy::React);

        let synth = builtin_agent("SynthesisAgent").unwrap();
        assert!(synth.mcp_servers.is_empty());
        assert_eq!(synth.iteration_strategy, IterationStrategy::Synthesis);

        assert!(builtin_agent("GhostAgent").is_none());
    }

    #[test]
    fn from_config_defaults_strategy() {
        let config = AgentConfig {
            mcp_servers: vec!["prometheus".into()],
            ..Default::default()
        };
        let agent = AgentDefinition::from_config("MetricsAgent", &config);
        assert_eq!(agent.iteration_strategy, IterationStrategy::React);
        assert_eq!(agent.mcp_servers, ["prometheus"]);
    }
}
