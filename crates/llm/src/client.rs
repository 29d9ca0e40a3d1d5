//! The LLM client: one call, one appended assistant message, one audit row.
//!
//! `generate_response` streams chunks onto the session's event channel as
//! they arrive (best-effort), detects `Final Answer:` on the message it just
//! generated, and hands the finished interaction to the hook sink.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;

use tarsy_domain::alert::NativeToolsSelection;
use tarsy_domain::conversation::{Conversation, Message};
use tarsy_domain::event::{channels, EventPayload, ParallelMetadata, StreamType};
use tarsy_domain::interaction::{InteractionType, LlmInteraction};
use tarsy_domain::sink::InteractionSink;
use tarsy_domain::Result;
use tarsy_events::EventBus;

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, StreamEvent, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One `generate_response` invocation.
#[derive(Clone)]
pub struct LlmRequest {
    pub conversation: Conversation,
    pub session_id: String,
    pub stage_execution_id: Option<String>,
    /// Provider name; `None` means the registry default.
    pub provider: Option<String>,
    pub max_tokens: Option<u32>,
    pub interaction_type: InteractionType,
    pub tools: Vec<ToolDefinition>,
    pub thinking: bool,
    pub native_tools_override: Option<NativeToolsSelection>,
    /// Links a summarization call to the tool call it summarizes.
    pub mcp_event_id: Option<String>,
    pub parallel: Option<ParallelMetadata>,
    pub stream_type: StreamType,
    pub step_description: String,
}

impl LlmRequest {
    pub fn investigation(session_id: impl Into<String>, conversation: Conversation) -> Self {
        Self {
            conversation,
            session_id: session_id.into(),
            stage_execution_id: None,
            provider: None,
            max_tokens: None,
            interaction_type: InteractionType::Investigation,
            tools: Vec::new(),
            thinking: false,
            native_tools_override: None,
            mcp_event_id: None,
            parallel: None,
            stream_type: StreamType::Thought,
            step_description: String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmClient {
    registry: Arc<ProviderRegistry>,
    bus: Arc<dyn EventBus>,
    sink: Arc<dyn InteractionSink>,
}

impl LlmClient {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        bus: Arc<dyn EventBus>,
        sink: Arc<dyn InteractionSink>,
    ) -> Self {
        Self { registry, bus, sink }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Run one completion and return the conversation with exactly one
    /// appended assistant message.
    pub async fn generate_response(&self, request: LlmRequest) -> Result<Conversation> {
        let provider = self.registry.get(request.provider.as_deref())?;
        let chat_request = ChatRequest {
            messages: request.conversation.messages.clone(),
            tools: request.tools.clone(),
            max_tokens: request.max_tokens,
            temperature: None,
            thinking: request.thinking,
            native_tools: request.native_tools_override.clone(),
        };

        let started = Instant::now();
        // Tool-calling turns need the structured (non-streamed) response;
        // plain text turns stream so dashboards see progress live.
        let response = if chat_request.tools.is_empty() {
            self.streamed_chat(&provider, chat_request, &request).await?
        } else {
            provider.chat(chat_request).await?
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let mut conversation = request.conversation;
        let mut assistant = Message::assistant(response.content.clone());
        assistant.tool_calls = response.tool_calls.clone();
        assistant.thinking = response.thinking.clone();
        conversation.push(assistant);

        // Promotion applies to the message generated in this call only.
        let interaction_type = if request.interaction_type == InteractionType::Investigation
            && starts_with_final_answer(&response.content)
        {
            InteractionType::FinalAnswer
        } else {
            request.interaction_type
        };

        let mut interaction = LlmInteraction::new(&request.session_id, conversation.clone());
        interaction.stage_execution_id = request.stage_execution_id.clone();
        interaction.model_name = provider.model().to_string();
        interaction.provider = provider.name().to_string();
        interaction.interaction_type = interaction_type;
        interaction.duration_ms = duration_ms;
        interaction.step_description = request.step_description.clone();
        interaction.thinking_content = response.thinking.clone();
        interaction.mcp_event_id = request.mcp_event_id.clone();
        interaction.native_tools_config = request
            .native_tools_override
            .as_ref()
            .and_then(|selection| serde_json::to_value(selection).ok());
        interaction.response_metadata = Some(serde_json::json!({
            "provider_metadata": response.metadata,
            "finish_reason": response.finish_reason,
            "usage": response.usage,
        }));
        self.sink.on_llm_interaction(interaction).await;

        Ok(conversation)
    }

    /// Stream the completion, publishing accumulated-content chunks.
    async fn streamed_chat(
        &self,
        provider: &Arc<dyn crate::traits::LlmProvider>,
        chat_request: ChatRequest,
        request: &LlmRequest,
    ) -> Result<ChatResponse> {
        let channel = channels::session_details(&request.session_id);
        let mut stream = provider.chat_stream(chat_request).await?;

        let mut content = String::new();
        let mut thinking = String::new();
        let mut usage = None;
        let mut finish_reason = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Delta { content: delta } => {
                    content.push_str(&delta);
                    let stream_type = if starts_with_final_answer(&content) {
                        StreamType::FinalAnswer
                    } else {
                        request.stream_type
                    };
                    self.bus
                        .publish_transient(
                            &channel,
                            &EventPayload::LlmStreamChunk {
                                session_id: request.session_id.clone(),
                                stage_execution_id: request.stage_execution_id.clone(),
                                stream_type,
                                content: content.clone(),
                                parallel: request.parallel.clone(),
                            },
                        )
                        .await;
                }
                StreamEvent::Thinking { content: delta } => {
                    thinking.push_str(&delta);
                    self.bus
                        .publish_transient(
                            &channel,
                            &EventPayload::LlmStreamChunk {
                                session_id: request.session_id.clone(),
                                stage_execution_id: request.stage_execution_id.clone(),
                                stream_type: StreamType::NativeThinking,
                                content: thinking.clone(),
                                parallel: request.parallel.clone(),
                            },
                        )
                        .await;
                }
                StreamEvent::Done {
                    usage: u,
                    finish_reason: reason,
                } => {
                    usage = u;
                    finish_reason = reason;
                }
            }
        }

        Ok(ChatResponse {
            content,
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
            tool_calls: Vec::new(),
            usage,
            finish_reason,
            metadata: serde_json::Value::Null,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Final-answer detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Does this assistant message begin with `Final Answer:`, optionally after
/// whitespace and a leading `Thought:` block? Case-sensitive; occurrences
/// further into the message do not count.
pub fn starts_with_final_answer(content: &str) -> bool {
    let mut in_thought = false;
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("Final Answer:") {
            return true;
        }
        if trimmed.starts_with("Thought:") {
            in_thought = true;
            continue;
        }
        if trimmed.starts_with("Action:") || trimmed.starts_with("Action Input:") {
            return false;
        }
        if in_thought {
            // Continuation line of the thought block.
            continue;
        }
        return false;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tarsy_domain::sink::RecordingSink;
    use tarsy_events::PollingEventBus;
    use tarsy_store::MemoryStore;

    use crate::traits::{BoxStream, LlmProvider, Usage};

    // ── final-answer detection ─────────────────────────────────────

    #[test]
    fn plain_final_answer_detected() {
        assert!(starts_with_final_answer("Final Answer: restart the pod"));
        assert!(starts_with_final_answer("\n  Final Answer: done"));
    }

    #[test]
    fn final_answer_after_thought_block_detected() {
        let content = "Thought: I have enough information now.\nIt all adds up.\n\nFinal Answer: the namespace is stuck";
        assert!(starts_with_final_answer(content));
    }

    #[test]
    fn action_turn_is_not_final() {
        let content = "Thought: need more data\nAction: kubernetes.get_pods\nAction Input: namespace: prod";
        assert!(!starts_with_final_answer(content));
    }

    #[test]
    fn mention_mid_text_does_not_count() {
        let content = "The runbook says to emit Final Answer: when done. Still working.";
        assert!(!starts_with_final_answer(content));
    }

    #[test]
    fn case_sensitive() {
        assert!(!starts_with_final_answer("final answer: nope"));
    }

    // ── client behavior with a scripted provider ───────────────────

    struct ScriptedProvider {
        chunks: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.chunks.concat(),
                ..Default::default()
            })
        }

        async fn chat_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let chunks = self.chunks.clone();
            Ok(Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok(StreamEvent::Delta { content: chunk.to_string() });
                }
                yield Ok(StreamEvent::Done {
                    usage: Some(Usage { input_tokens: 10, output_tokens: 5 }),
                    finish_reason: Some("stop".into()),
                });
            }))
        }
    }

    fn client_with(chunks: Vec<&'static str>) -> (LlmClient, Arc<RecordingSink>) {
        let registry = Arc::new(ProviderRegistry::with_provider(
            "scripted",
            Arc::new(ScriptedProvider { chunks }),
        ));
        let bus = Arc::new(PollingEventBus::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(20),
        ));
        let sink = Arc::new(RecordingSink::default());
        (LlmClient::new(registry, bus, sink.clone()), sink)
    }

    #[tokio::test]
    async fn appends_exactly_one_assistant_message() {
        let (client, sink) = client_with(vec!["Thought: looking\n", "Final Answer: fixed"]);
        let conversation: Conversation =
            [Message::system("sys"), Message::user("investigate")].into_iter().collect();

        let request = LlmRequest::investigation("sess-1", conversation.clone());
        let result = client.generate_response(request).await.unwrap();

        assert_eq!(result.len(), conversation.len() + 1);
        let appended = result.latest_assistant().unwrap();
        assert!(appended.content.ends_with("Final Answer: fixed"));

        let interactions = sink.llm.lock().unwrap();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].interaction_type, InteractionType::FinalAnswer);
        assert_eq!(interactions[0].provider, "scripted");
    }

    #[tokio::test]
    async fn earlier_final_answer_does_not_promote_later_thought() {
        let (client, sink) = client_with(vec!["Thought: still investigating the disk"]);
        // The conversation already contains an assistant message with a
        // Final Answer from a previous turn.
        let conversation: Conversation = [
            Message::user("investigate"),
            Message::assistant("Final Answer: preliminary"),
            Message::user("continue"),
        ]
        .into_iter()
        .collect();

        let request = LlmRequest::investigation("sess-1", conversation);
        client.generate_response(request).await.unwrap();

        let interactions = sink.llm.lock().unwrap();
        assert_eq!(
            interactions[0].interaction_type,
            InteractionType::Investigation
        );
    }

    #[tokio::test]
    async fn summarization_type_is_preserved() {
        let (client, sink) = client_with(vec!["Final Answer: short summary"]);
        let mut request = LlmRequest::investigation("sess-1", Conversation::new());
        request.interaction_type = InteractionType::Summarization;
        request.mcp_event_id = Some("mcp-1".into());
        client.generate_response(request).await.unwrap();

        let interactions = sink.llm.lock().unwrap();
        // Promotion only upgrades investigations.
        assert_eq!(
            interactions[0].interaction_type,
            InteractionType::Summarization
        );
        assert_eq!(interactions[0].mcp_event_id.as_deref(), Some("mcp-1"));
    }

    #[tokio::test]
    async fn streaming_chunks_carry_accumulated_content() {
        let registry = Arc::new(ProviderRegistry::with_provider(
            "scripted",
            Arc::new(ScriptedProvider {
                chunks: vec!["one ", "two"],
            }),
        ));
        let bus = Arc::new(PollingEventBus::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(20),
        ));
        let mut subscription = bus.subscribe("session:sess-1").await;
        let client = LlmClient::new(registry, bus, Arc::new(RecordingSink::default()));

        client
            .generate_response(LlmRequest::investigation("sess-1", Conversation::new()))
            .await
            .unwrap();

        let first = subscription.try_recv().unwrap();
        let second = subscription.try_recv().unwrap();
        assert_eq!(first.payload["content"], "one ");
        assert_eq!(second.payload["content"], "one two");
        assert_eq!(second.payload["type"], "llm.stream.chunk");
    }
}
