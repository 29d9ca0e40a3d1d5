//! Hierarchical execution-config resolution.
//!
//! Precedence, highest first: parallel-agent → stage → chain → agent →
//! system. Each non-null field at a higher level overrides the
//! accumulator. The alert-level MCP selection is *not* resolved here; it
//! is applied in the agent's tool-fetch path and always wins.

use tarsy_agents::AgentDefinition;
use tarsy_domain::chain::{ChainDefinition, ChainStageDefinition, ParallelAgentDefinition};
use tarsy_domain::config::{AgentConfig, ExecutionConfig, Settings};

pub fn resolve_execution_config(
    settings: &Settings,
    agent: &AgentDefinition,
    agent_config: Option<&AgentConfig>,
    chain: &ChainDefinition,
    stage: &ChainStageDefinition,
    parallel: Option<&ParallelAgentDefinition>,
) -> ExecutionConfig {
    // System level: the floor everything else overrides.
    let mut resolved = ExecutionConfig::from_settings(settings);
    resolved.iteration_strategy = agent.iteration_strategy;
    resolved.mcp_servers = agent.mcp_servers.clone();

    // Agent level.
    if let Some(config) = agent_config {
        if let Some(max) = config.max_iterations {
            resolved.max_iterations = max;
        }
        if let Some(force) = config.force_conclusion_at_max_iterations {
            resolved.force_conclusion_at_max_iterations = force;
        }
        if let Some(strategy) = config.iteration_strategy {
            resolved.iteration_strategy = strategy;
        }
        if let Some(provider) = &config.llm_provider {
            resolved.llm_provider = Some(provider.clone());
        }
    }

    // Chain level.
    if let Some(max) = chain.max_iterations {
        resolved.max_iterations = max;
    }
    if let Some(force) = chain.force_conclusion_at_max_iterations {
        resolved.force_conclusion_at_max_iterations = force;
    }
    if let Some(strategy) = chain.iteration_strategy {
        resolved.iteration_strategy = strategy;
    }
    if let Some(provider) = &chain.llm_provider {
        resolved.llm_provider = Some(provider.clone());
    }
    if let Some(servers) = &chain.mcp_servers {
        resolved.mcp_servers = servers.clone();
    }

    // Stage level.
    if let Some(max) = stage.max_iterations {
        resolved.max_iterations = max;
    }
    if let Some(force) = stage.force_conclusion_at_max_iterations {
        resolved.force_conclusion_at_max_iterations = force;
    }
    if let Some(strategy) = stage.iteration_strategy {
        resolved.iteration_strategy = strategy;
    }
    if let Some(provider) = &stage.llm_provider {
        resolved.llm_provider = Some(provider.clone());
    }
    if let Some(servers) = &stage.mcp_servers {
        resolved.mcp_servers = servers.clone();
    }

    // Parallel-agent level (highest precedence).
    if let Some(parallel) = parallel {
        if let Some(max) = parallel.max_iterations {
            resolved.max_iterations = max;
        }
        if let Some(force) = parallel.force_conclusion_at_max_iterations {
            resolved.force_conclusion_at_max_iterations = force;
        }
        if let Some(strategy) = parallel.iteration_strategy {
            resolved.iteration_strategy = strategy;
        }
        if let Some(provider) = &parallel.llm_provider {
            resolved.llm_provider = Some(provider.clone());
        }
        if let Some(servers) = &parallel.mcp_servers {
            resolved.mcp_servers = servers.clone();
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_domain::chain::IterationStrategy;

    fn chain(value: serde_json::Value) -> ChainDefinition {
        ChainDefinition::from_value(value).unwrap()
    }

    fn agent() -> AgentDefinition {
        AgentDefinition {
            name: "KubernetesAgent".into(),
            mcp_servers: vec!["kubernetes".into()],
            custom_instructions: None,
            iteration_strategy: IterationStrategy::React,
        }
    }

    #[test]
    fn system_defaults_flow_through() {
        let chain = chain(serde_json::json!({
            "chain_id": "c",
            "stages": [{"id": "s", "agent": "KubernetesAgent"}]
        }));
        let resolved = resolve_execution_config(
            &Settings::default(),
            &agent(),
            None,
            &chain,
            &chain.stages[0],
            None,
        );
        assert_eq!(resolved.max_iterations, 30);
        assert!(!resolved.force_conclusion_at_max_iterations);
        assert_eq!(resolved.iteration_strategy, IterationStrategy::React);
        assert_eq!(resolved.mcp_servers, ["kubernetes"]);
        assert!(resolved.llm_provider.is_none());
    }

    #[test]
    fn each_level_overrides_the_previous() {
        let chain = chain(serde_json::json!({
            "chain_id": "c",
            "max_iterations": 20,
            "llm_provider": "chain-provider",
            "stages": [{
                "id": "s",
                "max_iterations": 10,
                "agents": [
                    {"agent": "A", "max_iterations": 5, "llm_provider": "parallel-provider"},
                    {"agent": "B"}
                ]
            }]
        }));
        let agent_config = AgentConfig {
            max_iterations: Some(25),
            force_conclusion_at_max_iterations: Some(true),
            ..Default::default()
        };

        // Parallel agent A: its own values win.
        let resolved = resolve_execution_config(
            &Settings::default(),
            &agent(),
            Some(&agent_config),
            &chain,
            &chain.stages[0],
            Some(&chain.stages[0].agents[0]),
        );
        assert_eq!(resolved.max_iterations, 5);
        assert_eq!(resolved.llm_provider.as_deref(), Some("parallel-provider"));
        // Agent-level force_conclusion survives: nothing higher overrode it.
        assert!(resolved.force_conclusion_at_max_iterations);

        // Parallel agent B: stage values apply.
        let resolved = resolve_execution_config(
            &Settings::default(),
            &agent(),
            Some(&agent_config),
            &chain,
            &chain.stages[0],
            Some(&chain.stages[0].agents[1]),
        );
        assert_eq!(resolved.max_iterations, 10);
        assert_eq!(resolved.llm_provider.as_deref(), Some("chain-provider"));
    }

    #[test]
    fn stage_mcp_servers_replace_agent_defaults() {
        let chain = chain(serde_json::json!({
            "chain_id": "c",
            "stages": [{
                "id": "s",
                "agent": "KubernetesAgent",
                "mcp_servers": ["prometheus", "loki"]
            }]
        }));
        let resolved = resolve_execution_config(
            &Settings::default(),
            &agent(),
            None,
            &chain,
            &chain.stages[0],
            None,
        );
        assert_eq!(resolved.mcp_servers, ["prometheus", "loki"]);
    }
}
