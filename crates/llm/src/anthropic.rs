//! Anthropic Messages API adapter.

use serde_json::{json, Value};

use tarsy_domain::config::LlmProviderConfig;
use tarsy_domain::conversation::{Message, MessageRole, ToolCall};
use tarsy_domain::error::Error;
use tarsy_domain::Result;

use crate::sse::event_stream;
use crate::traits::{
    BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent, ToolDefinition, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8_192;

pub struct AnthropicProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl AnthropicProvider {
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
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        // The system prompt travels in its own field.
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(message_to_wire)
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.or(self.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature.or(self.temperature) {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_to_wire).collect());
        }
        if request.thinking {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": 4096});
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.body(&request, false);
        let value: Value = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| Error::Llm {
                provider: self.name.clone(),
                message: e.to_string(),
            })?;
        parse_message(&value)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.body(&request, true);
        let response = self.post(&body).await?;
        Ok(event_stream(response, |payload| {
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                return vec![];
            };
            match value["type"].as_str() {
                Some("content_block_delta") => {
                    let delta = &value["delta"];
                    match delta["type"].as_str() {
                        Some("text_delta") => vec![Ok(StreamEvent::Delta {
                            content: delta["text"].as_str().unwrap_or_default().to_string(),
                        })],
                        Some("thinking_delta") => vec![Ok(StreamEvent::Thinking {
                            content: delta["thinking"].as_str().unwrap_or_default().to_string(),
                        })],
                        _ => vec![],
                    }
                }
                Some("message_delta") => {
                    let finish = value["delta"]["stop_reason"].as_str().map(String::from);
                    let usage = value["usage"]["output_tokens"].as_u64().map(|out| Usage {
                        input_tokens: 0,
                        output_tokens: out,
                    });
                    vec![Ok(StreamEvent::Done {
                        usage,
                        finish_reason: finish,
                    })]
                }
                _ => vec![],
            }
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire conversions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_wire(message: &Message) -> Value {
    match message.role {
        MessageRole::Assistant if !message.tool_calls.is_empty() => {
            let mut content = Vec::new();
            if !message.content.is_empty() {
                content.push(json!({"type": "text", "text": message.content}));
            }
            for call in &message.tool_calls {
                content.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments,
                }));
            }
            json!({"role": "assistant", "content": content})
        }
        MessageRole::Tool => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.content,
            }]
        }),
        MessageRole::Assistant => json!({"role": "assistant", "content": message.content}),
        // System messages are filtered out before this point.
        _ => json!({"role": "user", "content": message.content}),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

fn parse_message(value: &Value) -> Result<ChatResponse> {
    let mut content = String::new();
    let mut thinking = None;
    let mut tool_calls = Vec::new();

    for block in value["content"].as_array().into_iter().flatten() {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("thinking") => {
                thinking = block["thinking"].as_str().map(String::from);
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    let usage = value.get("usage").map(|u| Usage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
    });

    Ok(ChatResponse {
        content,
        thinking,
        tool_calls,
        usage,
        finish_reason: value["stop_reason"].as_str().map(String::from),
        metadata: json!({"usage": value["usage"].clone()}),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_becomes_user_message() {
        let wire = message_to_wire(&Message::tool("pods: 3", "toolu_1"));
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["type"], "tool_result");
        assert_eq!(wire["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn parse_message_collects_blocks() {
        let value = json!({
            "content": [
                {"type": "thinking", "thinking": "considering the pods"},
                {"type": "text", "text": "Answer."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_pods", "input": {"ns": "prod"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        });
        let response = parse_message(&value).unwrap();
        assert_eq!(response.content, "Answer.");
        assert_eq!(response.thinking.as_deref(), Some("considering the pods"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.finish_reason.as_deref(), Some("tool_use"));
        assert_eq!(
            response.usage,
            Some(Usage { input_tokens: 10, output_tokens: 20 })
        );
    }
}
