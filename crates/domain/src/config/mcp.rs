//! MCP server configuration: one entry per tool server, each with a
//! transport (stdio subprocess, streamable HTTP, or SSE).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    /// Retry/timeout knobs shared by every server connection.
    #[serde(default)]
    pub recovery: McpRecoverySettings,
}

/// Recovery knobs as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRecoverySettings {
    /// Retries per operation, on top of the first attempt.
    #[serde(default = "d_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "d_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default = "d_reinit_timeout")]
    pub reinit_timeout_secs: u64,
    /// Randomized backoff window for rate-limited retries.
    #[serde(default = "d_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,
    #[serde(default = "d_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for McpRecoverySettings {
    fn default() -> Self {
        Self {
            retry_limit: d_retry_limit(),
            operation_timeout_secs: d_operation_timeout(),
            reinit_timeout_secs: d_reinit_timeout(),
            retry_backoff_min_ms: d_backoff_min_ms(),
            retry_backoff_max_ms: d_backoff_max_ms(),
        }
    }
}

fn d_retry_limit() -> u32 {
    1
}

fn d_operation_timeout() -> u64 {
    60
}

fn d_reinit_timeout() -> u64 {
    10
}

fn d_backoff_min_ms() -> u64 {
    250
}

fn d_backoff_max_ms() -> u64 {
    750
}

impl McpConfig {
    pub fn server(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }
}

/// Configuration for a single MCP server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name, referenced by agents and tool invocations
    /// (`<server>.<tool>`).
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransportConfig,
    /// Instructions text surfaced to agents using this server.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Extra masking patterns applied to this server's tool results.
    #[serde(default)]
    pub data_masking: Option<McpMaskingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpMaskingConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Names of built-in pattern groups (see `masking::builtin_group`).
    #[serde(default)]
    pub pattern_groups: Vec<String>,
    /// Custom regex patterns (replaced with `***MASKED***`).
    #[serde(default)]
    pub custom_patterns: Vec<String>,
}

/// Transport selection, tagged by the `transport` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpTransportConfig {
    /// Spawn a subprocess and speak JSON-RPC over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP: JSON-RPC over POST with an `Mcp-Session-Id` header.
    Http {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "d_true")]
        verify_ssl: bool,
        #[serde(default = "d_http_timeout")]
        timeout_secs: u64,
    },
    /// HTTP POST outbound plus a Server-Sent-Events inbound stream.
    Sse {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "d_true")]
        verify_ssl: bool,
        /// Long-poll read timeout for the SSE stream.
        #[serde(default = "d_sse_read_timeout")]
        read_timeout_secs: u64,
    },
}

impl McpServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("mcp server name must not be empty".into()));
        }
        match &self.transport {
            McpTransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "mcp server '{}': stdio command must not be empty",
                        self.name
                    )));
                }
            }
            McpTransportConfig::Http { url, headers, bearer_token, .. }
            | McpTransportConfig::Sse { url, headers, bearer_token, .. } => {
                if url.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "mcp server '{}': url must not be empty",
                        self.name
                    )));
                }
                // Bearer auth goes through the dedicated field; a manual
                // Authorization header would silently collide with it.
                let has_auth_header = headers.keys().any(|k| k.eq_ignore_ascii_case("authorization"));
                if has_auth_header && bearer_token.is_some() {
                    return Err(Error::Config(format!(
                        "mcp server '{}': set bearer_token or an Authorization header, not both",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn d_true() -> bool {
    true
}

fn d_http_timeout() -> u64 {
    60
}

fn d_sse_read_timeout() -> u64 {
    300
}
