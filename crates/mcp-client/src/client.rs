//! The per-session MCP client: session management, recovery, result
//! post-processing and audit recording.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use tarsy_domain::alert::McpSelection;
use tarsy_domain::config::{McpConfig, McpServerConfig};
use tarsy_domain::conversation::Conversation;
use tarsy_domain::interaction::{McpCommunicationType, McpInteraction};
use tarsy_domain::masking::DataMasker;
use tarsy_domain::sink::InteractionSink;
use tarsy_domain::timestamp::now_us;
use tarsy_domain::tokens::estimate_tokens;

use crate::config::McpRecoveryConfig;
use crate::protocol::{self, McpTool, ToolCallResult, ToolsListResult};
use crate::recovery::{classify, FailureClass};
use crate::transport::{self, Transport, TransportError};
use crate::McpError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summarizer contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the summarizer needs to compress one oversized observation.
#[derive(Debug, Clone)]
pub struct SummarizationRequest {
    pub session_id: String,
    pub stage_execution_id: Option<String>,
    pub server_name: String,
    pub tool_name: String,
    pub result_text: String,
    /// The investigation so far, for context.
    pub conversation: Conversation,
    /// The MCP interaction whose output is being summarized.
    pub mcp_event_id: String,
}

/// Implemented by the engine on top of the LLM client.
#[async_trait]
pub trait ResultSummarizer: Send + Sync {
    async fn summarize(&self, request: SummarizationRequest) -> tarsy_domain::Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport factory (injectable for tests)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        transport::connect(&config.transport).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One initialized connection to one server.
pub struct McpSession {
    pub server_name: String,
    transport: Box<dyn Transport>,
}

impl McpSession {
    async fn initialize(
        config: &McpServerConfig,
        factory: &dyn TransportFactory,
        reinit_timeout: std::time::Duration,
    ) -> Result<Self, McpError> {
        let init = async {
            let transport = factory.connect(config).await?;
            transport
                .request("initialize", Some(protocol::initialize_params()))
                .await?;
            transport.notify("notifications/initialized").await?;
            Ok::<_, TransportError>(transport)
        };
        let transport = tokio::time::timeout(reinit_timeout, init)
            .await
            .map_err(|_| McpError::InitFailed {
                server: config.name.clone(),
                message: "initialization timed out".into(),
            })?
            .map_err(|e| McpError::InitFailed {
                server: config.name.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(server = %config.name, "MCP session initialized");
        Ok(Self {
            server_name: config.name.clone(),
            transport,
        })
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, TransportError> {
        let result = self.transport.request("tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, TransportError> {
        let result = self
            .transport
            .request("tools/call", Some(protocol::tool_call_params(tool, arguments)))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Close the transport, swallowing only expected shutdown errors.
    async fn close(&self) -> Result<(), TransportError> {
        match self.transport.close().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_safe_teardown_error() => {
                tracing::debug!(server = %self.server_name, error = %e, "ignoring expected teardown error");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One client per claimed alert session; owns its server sessions and is
/// closed deterministically when the session leaves the worker.
pub struct McpClient {
    session_id: String,
    config: Arc<McpConfig>,
    selection: Option<McpSelection>,
    recovery: McpRecoveryConfig,
    factory: Arc<dyn TransportFactory>,
    sessions: AsyncMutex<HashMap<String, Arc<McpSession>>>,
    maskers: HashMap<String, DataMasker>,
    summarizer: Option<Arc<dyn ResultSummarizer>>,
    sink: Arc<dyn InteractionSink>,
}

impl McpClient {
    pub fn new(
        session_id: impl Into<String>,
        config: Arc<McpConfig>,
        selection: Option<McpSelection>,
        recovery: McpRecoveryConfig,
        sink: Arc<dyn InteractionSink>,
    ) -> Self {
        let maskers = build_maskers(&config);
        Self {
            session_id: session_id.into(),
            config,
            selection,
            recovery,
            factory: Arc::new(DefaultTransportFactory),
            sessions: AsyncMutex::new(HashMap::new()),
            maskers,
            summarizer: None,
            sink,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ResultSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    fn server_config(&self, server: &str) -> Result<McpServerConfig, McpError> {
        self.config
            .server(server)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))
    }

    async fn get_or_init_session(&self, server: &str) -> Result<Arc<McpSession>, McpError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(server) {
            return Ok(Arc::clone(session));
        }
        let config = self.server_config(server)?;
        let session = Arc::new(
            McpSession::initialize(&config, &*self.factory, self.recovery.reinit_timeout).await?,
        );
        sessions.insert(server.to_string(), Arc::clone(&session));
        Ok(session)
    }

    async fn teardown_session(&self, server: &str) {
        let session = self.sessions.lock().await.remove(server);
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                tracing::warn!(server, error = %e, "error tearing down MCP session");
            }
        }
    }

    /// Run one operation under the recovery policy: per-attempt timeout,
    /// classification, reinit-and-retry or backoff-and-retry, one retry.
    async fn run_with_recovery<T, F, Fut>(
        &self,
        server: &str,
        op_name: &str,
        attempt: F,
    ) -> Result<T, McpError>
    where
        F: Fn(Arc<McpSession>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempts_used = 0u32;
        loop {
            let session = self.get_or_init_session(server).await?;
            let outcome =
                tokio::time::timeout(self.recovery.operation_timeout, attempt(session)).await;
            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout,
            };

            let class = classify(&error);
            if attempts_used >= self.recovery.retry_limit || !class.is_retryable() {
                return Err(McpError::Transport(error));
            }
            attempts_used += 1;

            match class {
                FailureClass::RateLimited => {
                    let backoff = self.recovery.random_backoff();
                    tracing::warn!(
                        server, op = op_name, backoff_ms = backoff.as_millis() as u64,
                        "rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                _ => {
                    tracing::warn!(
                        server, op = op_name, error = %error,
                        "session lost, re-initializing and retrying"
                    );
                    self.teardown_session(server).await;
                }
            }
        }
    }

    /// List tools on a server, filtered by the alert-level MCP selection.
    pub async fn list_tools(
        &self,
        server: &str,
        stage_execution_id: Option<&str>,
    ) -> tarsy_domain::Result<Vec<McpTool>> {
        let started = now_us();
        let result = self
            .run_with_recovery(server, "tools/list", |session| async move {
                session.list_tools().await
            })
            .await;

        let mut interaction =
            McpInteraction::new(&self.session_id, server, McpCommunicationType::ToolList);
        interaction.stage_execution_id = stage_execution_id.map(String::from);
        interaction.duration_ms = (now_us() - started) / 1_000;

        match result {
            Ok(mut tools) => {
                if let Some(selection) = &self.selection {
                    if let Some(allowed) = selection.tools_for(server) {
                        tools.retain(|t| allowed.contains(&t.name));
                    }
                }
                interaction.success = true;
                interaction.available_tools = Some(serde_json::json!(tools
                    .iter()
                    .map(|t| t.name.clone())
                    .collect::<Vec<_>>()));
                self.sink.on_mcp_interaction(interaction).await;
                Ok(tools)
            }
            Err(e) => {
                interaction.error_message = Some(e.to_string());
                self.sink.on_mcp_interaction(interaction).await;
                Err(e.into())
            }
        }
    }

    /// Call a tool and post-process its result: mask, then summarize when
    /// the observation exceeds `max_result_tokens`. Returns a JSON object
    /// with the observation under `"result"`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        stage_execution_id: Option<&str>,
        conversation: Option<&Conversation>,
        max_result_tokens: Option<u32>,
    ) -> tarsy_domain::Result<Value> {
        let started = now_us();
        let result = self
            .run_with_recovery(server, "tools/call", |session| {
                let arguments = arguments.clone();
                let tool = tool.to_string();
                async move { session.call_tool(&tool, arguments).await }
            })
            .await;

        let mut interaction =
            McpInteraction::new(&self.session_id, server, McpCommunicationType::ToolCall);
        interaction.stage_execution_id = stage_execution_id.map(String::from);
        interaction.tool_name = Some(tool.to_string());
        interaction.tool_arguments = Some(arguments.clone());
        interaction.duration_ms = (now_us() - started) / 1_000;

        let call_result = match result {
            Ok(call_result) => call_result,
            Err(e) => {
                interaction.error_message = Some(e.to_string());
                self.sink.on_mcp_interaction(interaction).await;
                return Err(e.into());
            }
        };

        // 1. Mask the textual observation.
        let raw_text = call_result.joined_text();
        let masked = match self.maskers.get(server) {
            Some(masker) => masker.mask(&raw_text),
            None => raw_text,
        };

        let mut value = serde_json::json!({
            "result": masked,
            "is_error": call_result.is_error,
        });

        interaction.success = !call_result.is_error;
        interaction.tool_result = Some(value.clone());
        let request_id = interaction.request_id.clone();
        self.sink.on_mcp_interaction(interaction).await;

        // 2. Summarize when the post-mask observation would blow the budget.
        if let (Some(budget), Some(summarizer)) = (max_result_tokens, &self.summarizer) {
            let text = value["result"].as_str().unwrap_or_default();
            if estimate_tokens(text) > budget as usize {
                let request = SummarizationRequest {
                    session_id: self.session_id.clone(),
                    stage_execution_id: stage_execution_id.map(String::from),
                    server_name: server.to_string(),
                    tool_name: tool.to_string(),
                    result_text: text.to_string(),
                    conversation: conversation.cloned().unwrap_or_default(),
                    mcp_event_id: request_id,
                };
                match summarizer.summarize(request).await {
                    Ok(summary) => {
                        value["result"] = Value::String(summary);
                        value["summarized"] = Value::Bool(true);
                    }
                    Err(e) => {
                        tracing::warn!(server, tool, error = %e, "result summarization failed, using truncation");
                        let truncated: String =
                            text.chars().take(budget as usize * 4).collect();
                        value["result"] = Value::String(truncated);
                        value["truncated"] = Value::Bool(true);
                    }
                }
            }
        }

        Ok(value)
    }

    /// Close every server session. Expected teardown errors are swallowed;
    /// the first real error is returned after all sessions were attempted.
    pub async fn close(&self) -> tarsy_domain::Result<()> {
        let sessions: Vec<Arc<McpSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(server = %session.server_name, error = %e, "MCP teardown error");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(McpError::Transport(e).into()),
            None => Ok(()),
        }
    }
}

fn build_maskers(config: &McpConfig) -> HashMap<String, DataMasker> {
    let mut maskers = HashMap::new();
    for server in &config.servers {
        let Some(masking) = &server.data_masking else {
            continue;
        };
        if !masking.enabled {
            continue;
        }
        let mut masker = DataMasker::new();
        for group in &masking.pattern_groups {
            if let Err(e) = masker.add_group(group) {
                tracing::warn!(server = %server.name, group, error = %e, "skipping masking group");
            }
        }
        for pattern in &masking.custom_patterns {
            if let Err(e) = masker.add_custom(pattern) {
                tracing::warn!(server = %server.name, error = %e, "skipping custom masking pattern");
            }
        }
        if !masker.is_empty() {
            maskers.insert(server.name.clone(), masker);
        }
    }
    maskers
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
