mod agents;
mod llm;
mod mcp;

pub use agents::*;
pub use llm::*;
pub use mcp::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chain::ChainDefinition;
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The full gateway configuration, deserialized from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    /// Agent definitions (key = agent class name).
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// Chain definitions as raw JSON; validated (incl. the legacy
    /// `chat_enabled` rewrite) via [`ChainDefinition::from_value`].
    #[serde(default)]
    pub chains: Vec<serde_json::Value>,
}

impl Config {
    /// Validate the whole config, returning parsed chains.
    pub fn resolve_chains(&self) -> Result<Vec<ChainDefinition>> {
        self.chains
            .iter()
            .cloned()
            .map(ChainDefinition::from_value)
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// System-level settings: queue admission, iteration caps, retention and
/// sweep cadence. Every knob here is the lowest-precedence level of the
/// execution config hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database URL. `memory:` selects the in-memory store (dev/tests);
    /// `postgres://...` selects the relational store.
    #[serde(default = "d_database_url")]
    pub database_url: String,

    /// Refuse new alerts when this many sessions are already pending.
    /// `None` (or 0) disables admission control.
    #[serde(default)]
    pub max_queue_size: Option<usize>,

    /// Number of worker tasks claiming sessions on this replica.
    #[serde(default = "d_worker_count")]
    pub worker_count: usize,

    /// Replica identity stamped on claimed sessions. Defaults to the
    /// hostname, falling back to a random suffix.
    #[serde(default = "d_pod_id")]
    pub pod_id: String,

    #[serde(default = "d_max_iterations")]
    pub max_llm_mcp_iterations: u32,

    #[serde(default)]
    pub force_conclusion_at_max_iterations: bool,

    /// Upper bound for one LLM call inside an iteration loop.
    #[serde(default = "d_llm_iteration_timeout")]
    pub llm_iteration_timeout_secs: u64,

    #[serde(default = "d_true")]
    pub alert_data_masking_enabled: bool,

    #[serde(default = "d_event_retention_hours")]
    pub event_retention_hours: u64,

    #[serde(default = "d_event_cleanup_interval_hours")]
    pub event_cleanup_interval_hours: u64,

    #[serde(default = "d_history_retention_days")]
    pub history_retention_days: u64,

    /// History retention sweep cadence.
    #[serde(default = "d_history_cleanup_interval_hours")]
    pub history_cleanup_interval_hours: u64,

    /// Sessions IN_PROGRESS with a heartbeat older than this are orphans.
    #[serde(default = "d_orphan_timeout_minutes")]
    pub orphan_timeout_minutes: u64,

    #[serde(default = "d_orphan_check_interval_minutes")]
    pub orphan_check_interval_minutes: u64,

    /// Heartbeat cadence while a worker is executing a session.
    #[serde(default = "d_session_heartbeat_secs")]
    pub session_heartbeat_secs: u64,

    #[serde(default = "d_executive_summary_max_tokens")]
    pub executive_summary_max_tokens: u32,

    #[serde(default = "d_executive_summary_timeout")]
    pub executive_summary_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: d_database_url(),
            max_queue_size: None,
            worker_count: d_worker_count(),
            pod_id: d_pod_id(),
            max_llm_mcp_iterations: d_max_iterations(),
            force_conclusion_at_max_iterations: false,
            llm_iteration_timeout_secs: d_llm_iteration_timeout(),
            alert_data_masking_enabled: true,
            event_retention_hours: d_event_retention_hours(),
            event_cleanup_interval_hours: d_event_cleanup_interval_hours(),
            history_retention_days: d_history_retention_days(),
            history_cleanup_interval_hours: d_history_cleanup_interval_hours(),
            orphan_timeout_minutes: d_orphan_timeout_minutes(),
            orphan_check_interval_minutes: d_orphan_check_interval_minutes(),
            session_heartbeat_secs: d_session_heartbeat_secs(),
            executive_summary_max_tokens: d_executive_summary_max_tokens(),
            executive_summary_timeout_secs: d_executive_summary_timeout(),
        }
    }
}

impl Settings {
    /// Effective admission cap, treating 0 as disabled.
    pub fn queue_cap(&self) -> Option<usize> {
        self.max_queue_size.filter(|&n| n > 0)
    }
}

fn d_database_url() -> String {
    "memory:".into()
}

fn d_worker_count() -> usize {
    2
}

fn d_pod_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("pod-{}", &crate::timestamp::new_id()[..8]))
}

fn d_max_iterations() -> u32 {
    30
}

fn d_llm_iteration_timeout() -> u64 {
    300
}

fn d_true() -> bool {
    true
}

fn d_event_retention_hours() -> u64 {
    24
}

fn d_event_cleanup_interval_hours() -> u64 {
    6
}

fn d_history_retention_days() -> u64 {
    90
}

fn d_history_cleanup_interval_hours() -> u64 {
    12
}

fn d_orphan_timeout_minutes() -> u64 {
    30
}

fn d_orphan_check_interval_minutes() -> u64 {
    5
}

fn d_session_heartbeat_secs() -> u64 {
    5
}

fn d_executive_summary_max_tokens() -> u32 {
    150
}

fn d_executive_summary_timeout() -> u64 {
    60
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolved execution config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The outcome of walking the configuration hierarchy for one stage/agent
/// (parallel-agent → stage → chain → agent → system).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub max_iterations: u32,
    pub force_conclusion_at_max_iterations: bool,
    pub iteration_strategy: crate::chain::IterationStrategy,
    /// `None` means the registry default provider.
    pub llm_provider: Option<String>,
    /// Resolved server list; an alert-level MCP selection still overrides
    /// this in the tool-fetch path.
    pub mcp_servers: Vec<String>,
}

impl ExecutionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.max_llm_mcp_iterations,
            force_conclusion_at_max_iterations: settings.force_conclusion_at_max_iterations,
            iteration_strategy: crate::chain::IterationStrategy::default(),
            llm_provider: None,
            mcp_servers: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Startup validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Validate everything that can be validated without I/O. Returns
    /// non-fatal warnings for the system warnings endpoint.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for server in &self.mcp.servers {
            server.validate()?;
        }
        for (name, provider) in &self.llm.providers {
            provider.validate(name)?;
        }
        let chains = self.resolve_chains()?;

        // Every chain stage agent must be resolvable.
        for chain in &chains {
            for stage in &chain.stages {
                let agent_names: Vec<&str> = stage
                    .agent
                    .iter()
                    .map(String::as_str)
                    .chain(stage.agents.iter().map(|a| a.agent.as_str()))
                    .collect();
                for agent in agent_names {
                    if !self.agents.contains_key(agent) && !is_builtin_agent(agent) {
                        return Err(Error::Config(format!(
                            "chain '{}' stage '{}' references unknown agent '{}'",
                            chain.chain_id, stage.id, agent
                        )));
                    }
                }
            }
        }

        if self.llm.providers.is_empty() {
            warnings.push("no LLM providers configured; sessions will fail at execution".into());
        }
        if self.mcp.servers.is_empty() {
            warnings.push("no MCP servers configured; agents will run tool-less".into());
        }

        Ok(warnings)
    }
}

/// Agent classes that ship with the engine and need no config entry.
pub fn is_builtin_agent(name: &str) -> bool {
    matches!(name, "KubernetesAgent" | "SynthesisAgent" | "SummaryAgent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.max_llm_mcp_iterations, 30);
        assert!(!s.force_conclusion_at_max_iterations);
        assert_eq!(s.event_retention_hours, 24);
        assert_eq!(s.history_retention_days, 90);
        assert_eq!(s.orphan_timeout_minutes, 30);
        assert_eq!(s.executive_summary_max_tokens, 150);
        assert!(s.alert_data_masking_enabled);
        assert!(s.max_queue_size.is_none());
    }

    #[test]
    fn zero_queue_size_disables_admission() {
        let mut s = Settings::default();
        s.max_queue_size = Some(0);
        assert!(s.queue_cap().is_none());
        s.max_queue_size = Some(10);
        assert_eq!(s.queue_cap(), Some(10));
    }

    #[test]
    fn config_validation_flags_unknown_agent() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "chains": [{
                "chain_id": "c",
                "stages": [{"id": "s", "agent": "GhostAgent"}]
            }]
        }))
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn builtin_agents_need_no_config() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "chains": [{
                "chain_id": "c",
                "stages": [{"id": "s", "agent": "KubernetesAgent"}]
            }]
        }))
        .unwrap();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("LLM providers")));
    }
}
