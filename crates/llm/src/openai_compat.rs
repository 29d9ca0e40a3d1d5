//! OpenAI-compatible adapter.
//!
//! Covers OpenAI and xAI directly, plus anything else speaking the chat
//! completions contract behind a custom base url.

use serde_json::{json, Value};

use tarsy_domain::config::LlmProviderConfig;
use tarsy_domain::conversation::{Message, MessageRole, ToolCall};
use tarsy_domain::error::Error;
use tarsy_domain::Result;

use crate::sse::event_stream;
use crate::traits::{
    BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent, ToolDefinition, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const XAI_BASE_URL: &str = "https://api.x.ai/v1";

pub struct OpenAiCompatProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl OpenAiCompatProvider {
    pub fn from_config(name: &str, config: &LlmProviderConfig, is_xai: bool) -> Result<Self> {
        let api_key = config.api_key()?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| {
                if is_xai { XAI_BASE_URL } else { DEFAULT_BASE_URL }.to_string()
            })
            .trim_end_matches('/')
            .to_string();

        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(300));
        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Http(format!("client build: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            base_url,
            api_key,
            client,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_to_wire).collect());
        }
        if let Some(max) = request.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max);
        }
        if let Some(temperature) = request.temperature.or(self.temperature) {
            body["temperature"] = json!(temperature);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| provider_error(&self.name, e))?;
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
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.body(&request, false);
        let response = self.post(&body).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| provider_error(&self.name, e))?;
        parse_completion(&self.name, &value)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.body(&request, true);
        let response = self.post(&body).await?;
        Ok(event_stream(response, |payload| {
            if payload == "[DONE]" {
                return vec![];
            }
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                return vec![];
            };
            let mut events = Vec::new();
            let choice = &value["choices"][0];
            if let Some(content) = choice["delta"]["content"].as_str() {
                if !content.is_empty() {
                    events.push(Ok(StreamEvent::Delta {
                        content: content.to_string(),
                    }));
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                events.push(Ok(StreamEvent::Done {
                    usage: parse_usage(&value["usage"]),
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
        MessageRole::System => json!({"role": "system", "content": message.content}),
        MessageRole::User => json!({"role": "user", "content": message.content}),
        MessageRole::Assistant => {
            let mut wire = json!({"role": "assistant", "content": message.content});
            if !message.tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            wire
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "content": message.content,
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
        }),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

fn parse_completion(provider: &str, value: &Value) -> Result<ChatResponse> {
    let choice = value
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| Error::Llm {
            provider: provider.to_string(),
            message: format!("no choices in response: {value}"),
        })?;
    let message = &choice["message"];

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let arguments = call["function"]["arguments"]
                        .as_str()
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(Value::Null);
                    Some(ToolCall {
                        id: call["id"].as_str()?.to_string(),
                        name: call["function"]["name"].as_str()?.to_string(),
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        thinking: None,
        tool_calls,
        usage: parse_usage(&value["usage"]),
        finish_reason: choice["finish_reason"].as_str().map(String::from),
        metadata: json!({"usage": value["usage"].clone()}),
    })
}

fn parse_usage(value: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: value.get("prompt_tokens")?.as_u64()?,
        output_tokens: value.get("completion_tokens")?.as_u64().unwrap_or(0),
    })
}

fn provider_error(provider: &str, e: reqwest::Error) -> Error {
    Error::Llm {
        provider: provider.to_string(),
        message: e.to_string(),
    }
}
