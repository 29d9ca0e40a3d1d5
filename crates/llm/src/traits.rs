//! Provider-agnostic request/response types and the adapter trait.

use std::pin::Pin;

use futures_core::Stream;
use serde_json::Value;

use tarsy_domain::alert::NativeToolsSelection;
use tarsy_domain::conversation::{Message, ToolCall};
use tarsy_domain::Result;

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool definition the model may invoke natively (derived from MCP tool
/// discovery).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask for the provider's native reasoning trace where supported.
    pub thinking: bool,
    /// Provider-native search/url-context/code-execution toggles.
    pub native_tools: Option<NativeToolsSelection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    /// Captured reasoning trace (native-thinking providers).
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    /// Provider-specific extras (grounding metadata and the like).
    pub metadata: Value,
}

/// Streaming events produced by `chat_stream`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A piece of answer text.
    Delta { content: String },
    /// A piece of reasoning trace.
    Thinking { content: String },
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Implemented once per wire format.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// The configured provider name (e.g. `"google-default"`).
    fn name(&self) -> &str;

    /// The model requests are sent to.
    fn model(&self) -> &str;

    /// One full completion.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// A streamed completion. Implementations that cannot stream may return
    /// a two-event stream (one delta, one done) built from `chat`.
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
