//! Google Gemini adapter (`generateContent` API).
//!
//! Also serves VertexAI deployments through a custom base url. This is the
//! adapter with native thinking and the native search/url-context/
//! code-execution tools.

use serde_json::{json, Value};

use tarsy_domain::alert::NativeToolsSelection;
use tarsy_domain::config::LlmProviderConfig;
use tarsy_domain::conversation::{Message, MessageRole, ToolCall};
use tarsy_domain::error::Error;
use tarsy_domain::Result;

use crate::sse::event_stream;
use crate::traits::{
    BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent, ToolDefinition, Usage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Whether the config allows native tools at all; per-request selection
    /// still decides which ones are attached.
    native_tools_enabled: bool,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl GoogleProvider {
    pub fn from_config(name: &str, config: &LlmProviderConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(300));
        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client: builder
                .build()
                .map_err(|e| Error::Http(format!("client build: {e}")))?,
            native_tools_enabled: config.native_tools_enabled,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(message_to_wire)
            .collect();

        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let mut generation = serde_json::Map::new();
        if let Some(max) = request.max_tokens.or(self.max_tokens) {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(temperature) = request.temperature.or(self.temperature) {
            generation.insert("temperature".into(), json!(temperature));
        }
        if request.thinking {
            generation.insert("thinkingConfig".into(), json!({"includeThoughts": true}));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        let mut tools = Vec::new();
        if !request.tools.is_empty() {
            tools.push(json!({
                "functionDeclarations": request.tools.iter().map(tool_to_wire).collect::<Vec<_>>()
            }));
        }
        if self.native_tools_enabled {
            for native in native_tools_to_wire(request.native_tools.as_ref()) {
                tools.push(native);
            }
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    async fn post(&self, endpoint: &str, alt_sse: bool, body: &Value) -> Result<reqwest::Response> {
        let alt = if alt_sse { "&alt=sse" } else { "" };
        let url = format!(
            "{}/models/{}:{endpoint}?key={}{alt}",
            self.base_url, self.model, self.api_key
        );
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Llm {
                provider: self.name.clone(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Llm {
                provider: self.name.clone(),
                message: format!("HTTP {status}: {message}"),
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.body(&request);
        let value: Value = self
            .post("generateContent", false, &body)
            .await?
            .json()
            .await
            .map_err(|e| Error::Llm {
                provider: self.name.clone(),
                message: e.to_string(),
            })?;
        parse_candidate(&self.name, &value)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.body(&request);
        let response = self.post("streamGenerateContent", true, &body).await?;
        Ok(event_stream(response, |payload| {
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                return vec![];
            };
            let mut events = Vec::new();
            for part in value["candidates"][0]["content"]["parts"]
                .as_array()
                .into_iter()
                .flatten()
            {
                if let Some(text) = part["text"].as_str() {
                    if part["thought"].as_bool().unwrap_or(false) {
                        events.push(Ok(StreamEvent::Thinking {
                            content: text.to_string(),
                        }));
                    } else {
                        events.push(Ok(StreamEvent::Delta {
                            content: text.to_string(),
                        }));
                    }
                }
            }
            if let Some(reason) = value["candidates"][0]["finishReason"].as_str() {
                events.push(Ok(StreamEvent::Done {
                    usage: parse_usage(&value["usageMetadata"]),
                    finish_reason: Some(reason.to_string()),
                }));
            }
            events
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire conversions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_wire(message: &Message) -> Value {
    match message.role {
        MessageRole::Assistant if !message.tool_calls.is_empty() => {
            let mut parts = Vec::new();
            if !message.content.is_empty() {
                parts.push(json!({"text": message.content}));
            }
            for call in &message.tool_calls {
                parts.push(json!({
                    "functionCall": {"name": call.name, "args": call.arguments}
                }));
            }
            json!({"role": "model", "parts": parts})
        }
        MessageRole::Assistant => json!({"role": "model", "parts": [{"text": message.content}]}),
        MessageRole::Tool => json!({
            "role": "user",
            "parts": [{
                "functionResponse": {
                    "name": message.tool_call_id.clone().unwrap_or_default(),
                    "response": {"result": message.content},
                }
            }]
        }),
        _ => json!({"role": "user", "parts": [{"text": message.content}]}),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.input_schema,
    })
}

/// Native tool attachments for an explicit selection. With no selection,
/// search grounding alone is attached.
fn native_tools_to_wire(selection: Option<&NativeToolsSelection>) -> Vec<Value> {
    let mut tools = Vec::new();
    match selection {
        Some(selection) => {
            if selection.google_search.unwrap_or(false) {
                tools.push(json!({"googleSearch": {}}));
            }
            if selection.url_context.unwrap_or(false) {
                tools.push(json!({"urlContext": {}}));
            }
            if selection.code_execution.unwrap_or(false) {
                tools.push(json!({"codeExecution": {}}));
            }
        }
        None => tools.push(json!({"googleSearch": {}})),
    }
    tools
}

fn parse_candidate(provider: &str, value: &Value) -> Result<ChatResponse> {
    let candidate = value
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or_else(|| Error::Llm {
            provider: provider.to_string(),
            message: format!("no candidates in response: {value}"),
        })?;

    let mut content = String::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
        if let Some(text) = part["text"].as_str() {
            if part["thought"].as_bool().unwrap_or(false) {
                thinking_parts.push(text.to_string());
            } else {
                content.push_str(text);
            }
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(ToolCall {
                // Gemini has no call ids; the function name doubles as one.
                id: call["name"].as_str().unwrap_or_default().to_string(),
                name: call["name"].as_str().unwrap_or_default().to_string(),
                arguments: call["args"].clone(),
            });
        }
    }

    Ok(ChatResponse {
        content,
        thinking: if thinking_parts.is_empty() {
            None
        } else {
            Some(thinking_parts.join("\n"))
        },
        tool_calls,
        usage: parse_usage(&value["usageMetadata"]),
        finish_reason: candidate["finishReason"].as_str().map(String::from),
        metadata: json!({
            "usage": value["usageMetadata"].clone(),
            "grounding": candidate.get("groundingMetadata").cloned().unwrap_or(Value::Null),
        }),
    })
}

fn parse_usage(value: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: value.get("promptTokenCount")?.as_u64()?,
        output_tokens: value
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thought_parts_separate_from_answer() {
        let value = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "The namespace is stuck."}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 50, "candidatesTokenCount": 12}
        });
        let response = parse_candidate("google", &value).unwrap();
        assert_eq!(response.content, "The namespace is stuck.");
        assert_eq!(response.thinking.as_deref(), Some("pondering"));
        assert_eq!(response.usage.unwrap().input_tokens, 50);
    }

    #[test]
    fn function_call_parts_become_tool_calls() {
        let value = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "get_pods", "args": {"namespace": "prod"}}}
                ]}
            }]
        });
        let response = parse_candidate("google", &value).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "get_pods");
        assert_eq!(response.tool_calls[0].arguments["namespace"], "prod");
    }

    #[test]
    fn native_tool_selection_controls_attachments() {
        let selection = NativeToolsSelection {
            google_search: Some(true),
            code_execution: Some(true),
            url_context: None,
        };
        let tools = native_tools_to_wire(Some(&selection));
        assert_eq!(tools.len(), 2);
        // Default: search grounding only.
        assert_eq!(native_tools_to_wire(None).len(), 1);
    }

    #[test]
    fn tool_response_message_shape() {
        let wire = message_to_wire(&Message::tool("{\"pods\": 3}", "get_pods"));
        assert_eq!(wire["parts"][0]["functionResponse"]["name"], "get_pods");
    }
}
