//! Chain and agent registries built from configuration at startup.

use std::collections::HashMap;

use tarsy_agents::{builtin_agent, AgentDefinition};
use tarsy_domain::chain::ChainDefinition;
use tarsy_domain::config::{AgentConfig, Config};
use tarsy_domain::error::Error;
use tarsy_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps alert types to chains. Read-only after startup.
pub struct ChainRegistry {
    chains: HashMap<String, ChainDefinition>,
    by_alert_type: HashMap<String, String>,
}

impl ChainRegistry {
    pub fn from_chains(chains: Vec<ChainDefinition>) -> Result<Self> {
        let mut registry = Self {
            chains: HashMap::new(),
            by_alert_type: HashMap::new(),
        };
        for chain in chains {
            for alert_type in &chain.alert_types {
                if let Some(existing) = registry.by_alert_type.get(alert_type) {
                    return Err(Error::Config(format!(
                        "alert type '{alert_type}' claimed by both '{existing}' and '{}'",
                        chain.chain_id
                    )));
                }
                registry
                    .by_alert_type
                    .insert(alert_type.clone(), chain.chain_id.clone());
            }
            registry.chains.insert(chain.chain_id.clone(), chain);
        }
        Ok(registry)
    }

    /// Registry from config, with the built-in kubernetes chain filling in
    /// when nothing claims the `kubernetes` alert type.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut chains = config.resolve_chains()?;
        let kubernetes_claimed = chains
            .iter()
            .any(|c| c.alert_types.iter().any(|t| t == "kubernetes"));
        if !kubernetes_claimed {
            chains.push(builtin_kubernetes_chain()?);
        }
        Self::from_chains(chains)
    }

    pub fn chain_for_alert_type(&self, alert_type: &str) -> Option<&ChainDefinition> {
        self.by_alert_type
            .get(alert_type)
            .and_then(|chain_id| self.chains.get(chain_id))
    }

    pub fn get(&self, chain_id: &str) -> Option<&ChainDefinition> {
        self.chains.get(chain_id)
    }

    pub fn alert_types(&self) -> Vec<String> {
        self.by_alert_type.keys().cloned().collect()
    }
}

fn builtin_kubernetes_chain() -> Result<ChainDefinition> {
    ChainDefinition::from_value(serde_json::json!({
        "chain_id": "kubernetes-chain",
        "alert_types": ["kubernetes"],
        "stages": [
            {"id": "initial-analysis", "agent": "KubernetesAgent"}
        ]
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves agent class names to definitions: configured agents first,
/// built-ins as fallback.
pub struct AgentRegistry {
    configs: HashMap<String, AgentConfig>,
}

impl AgentRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            configs: config.agents.clone(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<AgentDefinition> {
        if let Some(config) = self.configs.get(name) {
            return Ok(AgentDefinition::from_config(name, config));
        }
        builtin_agent(name).ok_or_else(|| Error::NotFound(format!("agent '{name}'")))
    }

    pub fn config(&self, name: &str) -> Option<&AgentConfig> {
        self.configs.get(name)
    }
}
