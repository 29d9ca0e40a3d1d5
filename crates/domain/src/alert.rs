//! Alert ingress types: the external payload that triggers a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reject alert payloads larger than this once serialized.
pub const MAX_ALERT_DATA_BYTES: usize = 10 * 1024 * 1024;

/// An externally produced incident notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    #[serde(default)]
    pub runbook: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    /// Client-supplied event time (microseconds); ingestion time is used
    /// when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Value,
    /// Alert-level MCP override; always wins over resolver output.
    #[serde(default)]
    pub mcp: Option<McpSelection>,
}

impl Alert {
    /// Structural validation, before chain selection.
    pub fn validate(&self) -> Result<()> {
        if self.alert_type.trim().is_empty() {
            return Err(Error::Validation("alert_type must not be empty".into()));
        }
        let size = serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0);
        if size > MAX_ALERT_DATA_BYTES {
            return Err(Error::Validation(format!(
                "alert data too large: {size} bytes (max {MAX_ALERT_DATA_BYTES})"
            )));
        }
        if let Some(mcp) = &self.mcp {
            mcp.validate()?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP selection override
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Alert-level MCP server/tool selection. When present it replaces the
/// resolved server list in the agent's tool-fetch path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpSelection {
    pub servers: Vec<McpServerSelection>,
    #[serde(default)]
    pub native_tools: Option<NativeToolsSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerSelection {
    pub name: String,
    /// Restrict to these tools; `None` means all tools of the server.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

/// Provider-native tool toggles requested at the alert level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NativeToolsSelection {
    #[serde(default)]
    pub google_search: Option<bool>,
    #[serde(default)]
    pub code_execution: Option<bool>,
    #[serde(default)]
    pub url_context: Option<bool>,
}

impl McpSelection {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() && self.native_tools.is_none() {
            return Err(Error::Validation(
                "mcp selection must name at least one server or native tool".into(),
            ));
        }
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(Error::Validation("mcp server name must not be empty".into()));
            }
            if let Some(tools) = &server.tools {
                if tools.is_empty() {
                    return Err(Error::Validation(format!(
                        "mcp server '{}' has an empty tools list",
                        server.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The tools allowed for a server, or `None` when unrestricted.
    pub fn tools_for(&self, server: &str) -> Option<&[String]> {
        self.servers
            .iter()
            .find(|s| s.name == server)
            .and_then(|s| s.tools.as_deref())
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_deserializes_from_api_shape() {
        let alert: Alert = serde_json::from_value(serde_json::json!({
            "alert_type": "kubernetes",
            "runbook": "https://example/rb.md",
            "data": {"namespace": "prod", "message": "pods crashing"},
            "mcp": {"servers": [{"name": "kubernetes", "tools": ["get_pods"]}]}
        }))
        .unwrap();
        assert_eq!(alert.alert_type, "kubernetes");
        alert.validate().unwrap();
        let sel = alert.mcp.unwrap();
        assert_eq!(sel.tools_for("kubernetes").unwrap(), ["get_pods"]);
        assert!(sel.tools_for("aws").is_none());
    }

    #[test]
    fn empty_alert_type_rejected() {
        let alert = Alert {
            alert_type: "  ".into(),
            runbook: None,
            severity: None,
            timestamp: None,
            data: Value::Null,
            mcp: None,
        };
        assert!(matches!(alert.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn empty_selection_rejected() {
        let sel = McpSelection {
            servers: vec![],
            native_tools: None,
        };
        assert!(sel.validate().is_err());
    }

    #[test]
    fn empty_tools_list_rejected() {
        let sel = McpSelection {
            servers: vec![McpServerSelection {
                name: "kubernetes".into(),
                tools: Some(vec![]),
            }],
            native_tools: None,
        };
        assert!(sel.validate().is_err());
    }

    #[test]
    fn native_tools_only_selection_is_valid() {
        let sel = McpSelection {
            servers: vec![],
            native_tools: Some(NativeToolsSelection {
                google_search: Some(true),
                ..Default::default()
            }),
        };
        sel.validate().unwrap();
    }
}
