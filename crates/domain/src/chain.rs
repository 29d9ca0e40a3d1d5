//! Chain definitions: the ordered stage list an alert type maps to.
//!
//! Chain configs come from YAML (or the built-in registry) and are
//! snapshotted as JSON onto each session at ingestion so a running session
//! is immune to config reloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Iteration strategy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IterationStrategy {
    #[default]
    React,
    NativeThinking,
    Synthesis,
    SynthesisNativeThinking,
}

impl IterationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationStrategy::React => "react",
            IterationStrategy::NativeThinking => "native-thinking",
            IterationStrategy::Synthesis => "synthesis",
            IterationStrategy::SynthesisNativeThinking => "synthesis-native-thinking",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChatSettings {
    #[serde(default)]
    pub enabled: bool,
}

/// Per-agent overrides inside a parallel stage. Highest precedence level in
/// the execution config hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelAgentDefinition {
    pub agent: String,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub force_conclusion_at_max_iterations: Option<bool>,
    #[serde(default)]
    pub iteration_strategy: Option<IterationStrategy>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
}

/// One stage of a chain: a single agent, or a set of parallel agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainStageDefinition {
    /// Logical stage identifier, e.g. `"initial-analysis"`.
    pub id: String,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub agents: Vec<ParallelAgentDefinition>,
    /// Number of replicas when fanning out a single agent.
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub force_conclusion_at_max_iterations: Option<bool>,
    #[serde(default)]
    pub iteration_strategy: Option<IterationStrategy>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
}

impl ChainStageDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_parallel(&self) -> bool {
        !self.agents.is_empty() || self.replicas.map_or(false, |r| r > 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainDefinition {
    pub chain_id: String,
    /// Alert types routed to this chain.
    #[serde(default)]
    pub alert_types: Vec<String>,
    pub stages: Vec<ChainStageDefinition>,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub force_conclusion_at_max_iterations: Option<bool>,
    #[serde(default)]
    pub iteration_strategy: Option<IterationStrategy>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
}

impl ChainDefinition {
    /// Deserialize from a JSON value, applying the legacy `chat_enabled`
    /// rewrite first. Any other unknown field is rejected.
    pub fn from_value(mut value: Value) -> Result<Self> {
        migrate_legacy_chat(&mut value);
        let chain: ChainDefinition = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid chain definition: {e}")))?;
        chain.validate()?;
        Ok(chain)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_id.trim().is_empty() {
            return Err(Error::Config("chain_id must not be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(Error::Config(format!(
                "chain '{}' has no stages",
                self.chain_id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(Error::Config(format!(
                    "chain '{}' has duplicate stage id '{}'",
                    self.chain_id, stage.id
                )));
            }
            let has_single = stage.agent.is_some();
            let has_parallel = !stage.agents.is_empty();
            if has_single == has_parallel {
                return Err(Error::Config(format!(
                    "stage '{}' must define exactly one of 'agent' or 'agents'",
                    stage.id
                )));
            }
            if stage.replicas.is_some() && has_parallel {
                return Err(Error::Config(format!(
                    "stage '{}' cannot combine 'replicas' with 'agents'",
                    stage.id
                )));
            }
        }
        Ok(())
    }
}

/// Rewrite the legacy `chat_enabled: bool` field to `chat: {enabled}` unless
/// the new field is already present. The rewrite is silent; every other
/// unknown field still fails deserialization.
fn migrate_legacy_chat(value: &mut Value) {
    let Value::Object(map) = value else { return };
    let Some(legacy) = map.remove("chat_enabled") else {
        return;
    };
    if !map.contains_key("chat") {
        if let Value::Bool(enabled) = legacy {
            map.insert("chat".into(), serde_json::json!({ "enabled": enabled }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_chain() -> Value {
        serde_json::json!({
            "chain_id": "k8s-chain",
            "alert_types": ["kubernetes"],
            "stages": [
                {"id": "initial-analysis", "agent": "KubernetesAgent"},
                {"id": "synthesis", "agent": "SynthesisAgent", "iteration_strategy": "synthesis"}
            ]
        })
    }

    #[test]
    fn parses_and_validates() {
        let chain = ChainDefinition::from_value(base_chain()).unwrap();
        assert_eq!(chain.chain_id, "k8s-chain");
        assert_eq!(chain.stages.len(), 2);
        assert_eq!(
            chain.stages[1].iteration_strategy,
            Some(IterationStrategy::Synthesis)
        );
        assert!(!chain.chat.enabled);
    }

    #[test]
    fn legacy_chat_enabled_is_rewritten() {
        let mut v = base_chain();
        v["chat_enabled"] = Value::Bool(true);
        let chain = ChainDefinition::from_value(v).unwrap();
        assert!(chain.chat.enabled);
    }

    #[test]
    fn legacy_rewrite_does_not_clobber_new_field() {
        let mut v = base_chain();
        v["chat_enabled"] = Value::Bool(true);
        v["chat"] = serde_json::json!({"enabled": false});
        let chain = ChainDefinition::from_value(v).unwrap();
        assert!(!chain.chat.enabled);
    }

    #[test]
    fn unknown_field_rejected() {
        let mut v = base_chain();
        v["surprise"] = Value::Bool(true);
        assert!(matches!(
            ChainDefinition::from_value(v),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn stage_requires_agent_xor_agents() {
        let v = serde_json::json!({
            "chain_id": "c",
            "stages": [{"id": "s1"}]
        });
        assert!(ChainDefinition::from_value(v).is_err());

        let v = serde_json::json!({
            "chain_id": "c",
            "stages": [{
                "id": "s1",
                "agent": "A",
                "agents": [{"agent": "B"}]
            }]
        });
        assert!(ChainDefinition::from_value(v).is_err());
    }

    #[test]
    fn duplicate_stage_ids_rejected() {
        let v = serde_json::json!({
            "chain_id": "c",
            "stages": [
                {"id": "s1", "agent": "A"},
                {"id": "s1", "agent": "B"}
            ]
        });
        assert!(ChainDefinition::from_value(v).is_err());
    }

    #[test]
    fn parallel_stage_detection() {
        let v = serde_json::json!({
            "chain_id": "c",
            "stages": [{
                "id": "investigate",
                "agents": [{"agent": "A"}, {"agent": "B"}]
            }]
        });
        let chain = ChainDefinition::from_value(v).unwrap();
        assert!(chain.stages[0].is_parallel());
    }

    #[test]
    fn strategy_kebab_case_serde() {
        assert_eq!(
            serde_json::to_string(&IterationStrategy::SynthesisNativeThinking).unwrap(),
            "\"synthesis-native-thinking\""
        );
    }
}
