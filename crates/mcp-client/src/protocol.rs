//! MCP wire protocol: JSON-RPC 2.0 framing and the payload shapes we
//! exchange with tool servers.
//!
//! Outgoing traffic is built directly as serialized frames (a request when
//! an id is present, a notification otherwise); only responses need a
//! parsed representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outgoing frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize a request frame (expects a response with the same id).
pub fn request_frame(id: u64, method: &str, params: Option<&Value>) -> String {
    let mut frame = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params.clone();
    }
    frame.to_string()
}

/// Serialize a notification frame (fire-and-forget, no id).
pub fn notification_frame(method: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
    })
    .to_string()
}

/// Parameters for the `initialize` handshake.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "tarsy",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Parameters for a `tools/call` request.
pub fn tool_call_params(tool: &str, arguments: Value) -> Value {
    serde_json::json!({
        "name": tool,
        "arguments": arguments,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incoming frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The `result` value, or the server's error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool definition discovered via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// All textual content joined, in order.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_carries_id_and_params() {
        let params = tool_call_params("get_pods", serde_json::json!({"namespace": "prod"}));
        let frame = request_frame(7, "tools/call", Some(&params));
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["params"]["name"], "get_pods");
    }

    #[test]
    fn request_frame_without_params_omits_field() {
        let frame = request_frame(1, "tools/list", None);
        assert!(!frame.contains("params"));
    }

    #[test]
    fn notification_frame_has_no_id() {
        let frame = notification_frame("notifications/initialized");
        assert!(!frame.contains("\"id\""));
        assert!(frame.contains("notifications/initialized"));
    }

    #[test]
    fn response_into_result_splits_ok_and_error() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(ok.into_result().is_ok());

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"Invalid params"}}"#,
        )
        .unwrap();
        let rpc_error = err.into_result().unwrap_err();
        assert_eq!(rpc_error.code, -32602);
        assert_eq!(rpc_error.to_string(), "JSON-RPC error -32602: Invalid params");
    }

    #[test]
    fn missing_result_defaults_to_null() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3}"#).unwrap();
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn tool_schema_defaults_when_missing() {
        let result: ToolsListResult =
            serde_json::from_str(r#"{"tools":[{"name":"ping"}]}"#).unwrap();
        assert_eq!(result.tools[0].name, "ping");
        assert_eq!(result.tools[0].input_schema["type"], "object");
        assert_eq!(result.tools[0].description, "");
    }

    #[test]
    fn joined_text_skips_non_text_content() {
        let result: ToolCallResult = serde_json::from_str(
            r#"{"content":[
                {"type":"text","text":"line one"},
                {"type":"image","text":""},
                {"type":"text","text":"line two"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(result.joined_text(), "line one\nline two");
        assert!(!result.is_error);
    }

    #[test]
    fn error_flag_deserializes() {
        let result: ToolCallResult = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"not found"}],"isError":true}"#,
        )
        .unwrap();
        assert!(result.is_error);
    }

    #[test]
    fn initialize_params_advertise_protocol_version() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "tarsy");
    }
}
