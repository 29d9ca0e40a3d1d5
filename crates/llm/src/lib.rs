//! `tarsy-llm` — provider-agnostic chat with streaming and audit recording.
//!
//! Provider adapters translate between our conversation types and each wire
//! format: [`openai_compat`] (OpenAI, xAI, anything base-url compatible),
//! [`anthropic`], and [`google`] (Gemini; VertexAI via base url). The
//! [`client::LlmClient`] sits on top: it streams chunks onto the session's
//! event channel, detects `Final Answer:` on the freshly generated message,
//! and records every completion as an [`tarsy_domain::interaction::LlmInteraction`].

pub mod anthropic;
pub mod client;
pub mod google;
pub mod openai_compat;
pub mod registry;
mod sse;
pub mod traits;

pub use client::{LlmClient, LlmRequest};
pub use registry::ProviderRegistry;
pub use traits::{ChatRequest, ChatResponse, LlmProvider, StreamEvent, ToolDefinition, Usage};
