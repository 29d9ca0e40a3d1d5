//! Agent configuration: iteration strategy, default MCP servers and
//! custom instructions per agent class.

use serde::{Deserialize, Serialize};

use crate::chain::IterationStrategy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// MCP servers this agent consults by default.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    /// Free-text instructions appended to the system prompt.
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub iteration_strategy: Option<IterationStrategy>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub force_conclusion_at_max_iterations: Option<bool>,
    #[serde(default)]
    pub llm_provider: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_from_yaml() {
        let cfg: AgentConfig = serde_yaml::from_str(
            r#"
mcp_servers: [kubernetes, prometheus]
custom_instructions: Prefer read-only diagnostics.
iteration_strategy: react
max_iterations: 12
"#,
        )
        .unwrap();
        assert_eq!(cfg.mcp_servers, ["kubernetes", "prometheus"]);
        assert_eq!(cfg.iteration_strategy, Some(IterationStrategy::React));
        assert_eq!(cfg.max_iterations, Some(12));
        assert!(cfg.force_conclusion_at_max_iterations.is_none());
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg: AgentConfig = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.mcp_servers.is_empty());
        assert!(cfg.llm_provider.is_none());
    }
}
