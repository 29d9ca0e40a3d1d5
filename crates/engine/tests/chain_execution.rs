//! End-to-end engine scenarios against the in-memory store: happy path,
//! pause/resume, user cancel vs timeout, and MCP session-lost recovery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tarsy_domain::alert::Alert;
use tarsy_domain::config::{Config, McpServerConfig, Settings};
use tarsy_domain::conversation::Conversation;
use tarsy_domain::event::channels;
use tarsy_domain::interaction::InteractionType;
use tarsy_domain::session::AlertSession;
use tarsy_domain::status::{SessionStatus, StageStatus};
use tarsy_domain::Result;
use tarsy_engine::hooks::EngineHooks;
use tarsy_engine::{
    AgentRegistry, AlertService, CancellationTracker, ChainExecutor, ChainRegistry,
    SessionRunner, SessionService,
};
use tarsy_events::{EventBus, PollingEventBus};
use tarsy_llm::{
    ChatRequest, ChatResponse, LlmClient, LlmProvider, ProviderRegistry, StreamEvent,
};
use tarsy_mcp::{McpRecoveryConfig, Transport, TransportError, TransportFactory};
use tarsy_store::{MemoryStore, Store};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type CallHook = Box<dyn Fn() + Send + Sync>;

struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    on_call: Option<CallHook>,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            on_call: None,
        })
    }

    fn with_hook(responses: Vec<&str>, hook: CallHook) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            on_call: Some(hook),
        })
    }

    fn push(&self, responses: Vec<&str>) {
        let mut queue = self.responses.lock().unwrap();
        queue.extend(responses.into_iter().map(String::from));
    }

    fn next_response(&self) -> String {
        if let Some(hook) = &self.on_call {
            hook();
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Final Answer: script exhausted".to_string())
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: self.next_response(),
            ..Default::default()
        })
    }

    async fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<tarsy_llm::traits::BoxStream<'static, Result<StreamEvent>>> {
        let content = self.next_response();
        Ok(Box::pin(async_stream::stream! {
            yield Ok(StreamEvent::Delta { content });
            yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted MCP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Answers initialize/tools-list with canned data; `tools/call` pops the
/// shared failure queue first, then returns the canned result.
struct ScriptedTransport {
    call_failures: Arc<Mutex<VecDeque<TransportError>>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(
        &self,
        method: &str,
        _params: Option<serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, TransportError> {
        match method {
            "initialize" => Ok(serde_json::json!({"capabilities": {}})),
            "tools/list" => Ok(serde_json::json!({
                "tools": [{"name": "get_pods", "description": "List pods"}]
            })),
            "tools/call" => {
                if let Some(failure) = self.call_failures.lock().unwrap().pop_front() {
                    return Err(failure);
                }
                Ok(serde_json::json!({
                    "content": [{"type": "text", "text": "3 pods in CrashLoopBackOff"}]
                }))
            }
            _ => Ok(serde_json::Value::Null),
        }
    }

    async fn notify(&self, _method: &str) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        Ok(())
    }
}

struct ScriptedFactory {
    call_failures: Arc<Mutex<VecDeque<TransportError>>>,
    init_count: AtomicU32,
}

impl ScriptedFactory {
    fn new(call_failures: Vec<TransportError>) -> Arc<Self> {
        Arc::new(Self {
            call_failures: Arc::new(Mutex::new(call_failures.into())),
            init_count: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn connect(
        &self,
        _config: &McpServerConfig,
    ) -> std::result::Result<Box<dyn Transport>, TransportError> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedTransport {
            call_failures: Arc::clone(&self.call_failures),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stack wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Stack {
    store: Arc<MemoryStore>,
    bus: Arc<PollingEventBus>,
    tracker: Arc<CancellationTracker>,
    runner: Arc<SessionRunner>,
    alerts: AlertService,
    sessions: SessionService,
}

fn config_with_mcp() -> Config {
    serde_json::from_value(serde_json::json!({
        "mcp": {
            "servers": [{
                "name": "kubernetes",
                "transport": "stdio",
                "command": "unused"
            }]
        }
    }))
    .unwrap()
}

fn build_stack(
    settings: Settings,
    config: Config,
    llm: Arc<dyn LlmProvider>,
    factory: Arc<ScriptedFactory>,
) -> Stack {
    let settings = Arc::new(settings);
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(PollingEventBus::new(
        store.clone() as Arc<dyn Store>,
        Duration::from_millis(20),
    ));
    let sink = Arc::new(EngineHooks::new(
        store.clone() as Arc<dyn Store>,
        bus.clone() as Arc<dyn EventBus>,
    ));
    let registry = Arc::new(ProviderRegistry::with_provider("scripted", llm));
    let llm_client = Arc::new(LlmClient::new(
        registry,
        bus.clone() as Arc<dyn EventBus>,
        sink.clone() as Arc<dyn tarsy_domain::sink::InteractionSink>,
    ));
    let tracker = Arc::new(CancellationTracker::new());
    let chains = Arc::new(ChainRegistry::from_config(&config).unwrap());
    let agents = Arc::new(AgentRegistry::from_config(&config));

    let executor = Arc::new(
        ChainExecutor::new(
            store.clone() as Arc<dyn Store>,
            bus.clone() as Arc<dyn EventBus>,
            llm_client,
            Arc::new(config.mcp.clone()),
            McpRecoveryConfig {
                retry_backoff_min: Duration::from_millis(1),
                retry_backoff_max: Duration::from_millis(2),
                ..Default::default()
            },
            agents,
            settings.clone(),
            sink.clone() as Arc<dyn tarsy_domain::sink::InteractionSink>,
            tracker.clone(),
        )
        .with_transport_factory(factory),
    );
    let runner = Arc::new(SessionRunner::new(
        executor,
        store.clone() as Arc<dyn Store>,
        tracker.clone(),
        settings.session_heartbeat_secs,
    ));
    let alerts = AlertService::new(
        store.clone() as Arc<dyn Store>,
        bus.clone() as Arc<dyn EventBus>,
        chains,
        settings.clone(),
    );
    let sessions = SessionService::new(
        store.clone() as Arc<dyn Store>,
        bus.clone() as Arc<dyn EventBus>,
        tracker.clone(),
        runner.clone(),
        settings,
    );

    Stack {
        store,
        bus,
        tracker,
        runner,
        alerts,
        sessions,
    }
}

fn kubernetes_alert() -> Alert {
    Alert {
        alert_type: "kubernetes".into(),
        runbook: Some("https://example/rb.md".into()),
        severity: None,
        timestamp: None,
        data: serde_json::json!({"namespace": "prod", "message": "pods crashing"}),
        mcp: None,
    }
}

async fn submit_and_claim(stack: &Stack) -> AlertSession {
    stack.alerts.submit(kubernetes_alert(), None).await.unwrap();
    stack
        .store
        .claim_next_pending_session("pod-test")
        .await
        .unwrap()
        .expect("a pending session to claim")
}

async fn wait_for_status(stack: &Stack, session_id: &str, status: SessionStatus) -> AlertSession {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let session = stack.store.get_session(session_id).await.unwrap().unwrap();
            if session.status == status {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {status}"))
}

fn event_types(events: &[tarsy_domain::event::PublishedEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.payload["type"].as_str().map(String::from))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_runs_chain_to_completion() {
    let llm = ScriptedLlm::new(vec![
        "Thought: check the pods\nAction: kubernetes.get_pods\nAction Input: namespace: prod",
        "Thought: I now know the final answer\nFinal Answer: pods crash due to OOM; raise limits",
        "OOM kills in prod; raise memory limits.",
    ]);
    let factory = ScriptedFactory::new(vec![]);
    let stack = build_stack(
        Settings::default(),
        config_with_mcp(),
        llm,
        Arc::clone(&factory),
    );

    let session = submit_and_claim(&stack).await;
    stack.runner.run(session.clone(), None).await;

    let done = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.final_analysis.unwrap().contains("OOM"));
    assert_eq!(
        done.final_analysis_summary.as_deref(),
        Some("OOM kills in prod; raise memory limits.")
    );
    assert!(done.executive_summary_error.is_none());
    assert!(done.completed_at_us.is_some());

    // Stage row completed with output, no error.
    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].status, StageStatus::Completed);
    assert!(stages[0].stage_output.is_some());
    assert!(stages[0].error_message.is_none());
    assert!(stages[0].duration_ms.is_some());

    // Audit trail: investigation + final answer + executive summary, plus
    // the MCP list/call rows.
    let llm_rows = stack
        .store
        .get_llm_interactions_for_session(&session.session_id)
        .await
        .unwrap();
    assert!(llm_rows
        .iter()
        .any(|i| i.interaction_type == InteractionType::FinalAnswer));
    assert!(llm_rows
        .iter()
        .any(|i| i.interaction_type == InteractionType::FinalAnalysisSummary));
    let mcp_rows = stack
        .store
        .get_mcp_interactions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(mcp_rows.len(), 2); // tools/list + tools/call
    assert!(mcp_rows.iter().all(|i| i.success));

    // Event log: lifecycle on `sessions`, detail on the session channel.
    let lifecycle = stack
        .bus
        .events_after(channels::SESSIONS, 0, 100)
        .await
        .unwrap();
    let types = event_types(&lifecycle);
    assert_eq!(
        types,
        ["session.created", "session.started", "session.completed"]
    );

    let detail = stack
        .bus
        .events_after(&channels::session_details(&session.session_id), 0, 100)
        .await
        .unwrap();
    let types = event_types(&detail);
    assert!(types.contains(&"stage.started".to_string()));
    assert!(types.contains(&"mcp.tool_call".to_string()));
    assert!(types.contains(&"llm.interaction".to_string()));
    assert!(types.contains(&"stage.completed".to_string()));
    // Event ids strictly ascend within the channel.
    let ids: Vec<i64> = detail.iter().filter_map(|e| e.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn pause_at_max_iterations_then_resume_to_completion() {
    let llm = ScriptedLlm::new(vec![
        "Thought: step one\nAction: kubernetes.get_pods\nAction Input: namespace: prod",
        "Thought: step two\nAction: kubernetes.get_pods\nAction Input: namespace: prod",
    ]);
    let llm_handle = Arc::clone(&llm);
    let factory = ScriptedFactory::new(vec![]);
    let mut settings = Settings::default();
    settings.max_llm_mcp_iterations = 2;
    settings.force_conclusion_at_max_iterations = false;
    let stack = build_stack(settings, config_with_mcp(), llm, Arc::clone(&factory));

    let session = submit_and_claim(&stack).await;
    stack.runner.run(session.clone(), None).await;

    // Paused, with the captured state in pause metadata.
    let paused = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    let meta = paused.pause_metadata.clone().unwrap();
    assert_eq!(meta.current_iteration, Some(2));
    assert_eq!(
        serde_json::to_value(meta.reason).unwrap(),
        "max_iterations_reached"
    );
    assert_eq!(meta.conversations.len(), 1);
    let (paused_exec_id, captured) = meta.conversations.iter().next().unwrap();
    let captured: Conversation = captured.clone();

    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages[0].status, StageStatus::Paused);
    assert!(stages[0].paused_at_us.is_some());
    assert_eq!(&stages[0].execution_id, paused_exec_id);

    // Feed the continuation and resume.
    llm_handle.push(vec![
        "Thought: enough\nFinal Answer: scale up the namespace quota",
        "Quota exhausted; scale it up.",
    ]);
    stack.sessions.resume(&session.session_id).await.unwrap();

    let done = wait_for_status(&stack, &session.session_id, SessionStatus::Completed).await;
    assert!(done.pause_metadata.is_none());
    assert!(done.final_analysis.unwrap().contains("quota"));

    // The resumed conversation continued from the captured one: the next
    // investigation interaction's conversation starts with exactly the
    // captured message sequence.
    let llm_rows = stack
        .store
        .get_llm_interactions_for_session(&session.session_id)
        .await
        .unwrap();
    let resumed = llm_rows
        .iter()
        .find(|i| {
            i.interaction_type == InteractionType::FinalAnswer
                && i.stage_execution_id.as_deref() == Some(paused_exec_id.as_str())
        })
        .expect("a final-answer interaction on the resumed stage");
    assert!(resumed.conversation.len() > captured.len());
    assert_eq!(
        &resumed.conversation.messages[..captured.len()],
        &captured.messages[..]
    );

    // Stage left PAUSED and completed.
    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages[0].status, StageStatus::Completed);

    // Lifecycle events include paused then resumed then completed.
    let lifecycle = stack
        .bus
        .events_after(channels::SESSIONS, 0, 100)
        .await
        .unwrap();
    let types = event_types(&lifecycle);
    assert!(types.contains(&"session.paused".to_string()));
    assert!(types.contains(&"session.resumed".to_string()));
    assert!(types.contains(&"session.completed".to_string()));
}

#[tokio::test]
async fn user_cancel_classifies_as_cancelled() {
    // The provider flips the cancel flag (with a user mark) before
    // answering, so the controller unwinds at its next check.
    let tracker_slot: Arc<Mutex<Option<(Arc<CancellationTracker>, String)>>> =
        Arc::new(Mutex::new(None));
    let hook_slot = Arc::clone(&tracker_slot);
    let llm = ScriptedLlm::with_hook(
        vec!["Thought: looking\nAction: kubernetes.get_pods\nAction Input: namespace: prod"],
        Box::new(move || {
            if let Some((tracker, session_id)) = hook_slot.lock().unwrap().as_ref() {
                tracker.mark_user_cancelled(session_id);
                tracker.cancel_local(session_id);
            }
        }),
    );
    let factory = ScriptedFactory::new(vec![]);
    let stack = build_stack(
        Settings::default(),
        config_with_mcp(),
        llm,
        Arc::clone(&factory),
    );

    let session = submit_and_claim(&stack).await;
    *tracker_slot.lock().unwrap() = Some((stack.tracker.clone(), session.session_id.clone()));
    stack.runner.run(session.clone(), None).await;

    let done = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::Cancelled);

    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages[0].status, StageStatus::Cancelled);

    let lifecycle = stack
        .bus
        .events_after(channels::SESSIONS, 0, 100)
        .await
        .unwrap();
    let types = event_types(&lifecycle);
    assert!(types.contains(&"session.cancelled".to_string()));
    assert!(!types.contains(&"session.failed".to_string()));
}

#[tokio::test]
async fn unmarked_cancellation_classifies_as_timed_out() {
    let tracker_slot: Arc<Mutex<Option<(Arc<CancellationTracker>, String)>>> =
        Arc::new(Mutex::new(None));
    let hook_slot = Arc::clone(&tracker_slot);
    let llm = ScriptedLlm::with_hook(
        vec!["Thought: looking\nAction: kubernetes.get_pods\nAction Input: namespace: prod"],
        Box::new(move || {
            if let Some((tracker, session_id)) = hook_slot.lock().unwrap().as_ref() {
                // Flag flipped with no user mark: the timeout path.
                tracker.cancel_local(session_id);
            }
        }),
    );
    let factory = ScriptedFactory::new(vec![]);
    let stack = build_stack(
        Settings::default(),
        config_with_mcp(),
        llm,
        Arc::clone(&factory),
    );

    let session = submit_and_claim(&stack).await;
    *tracker_slot.lock().unwrap() = Some((stack.tracker.clone(), session.session_id.clone()));
    stack.runner.run(session.clone(), None).await;

    let done = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::TimedOut);
    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages[0].status, StageStatus::TimedOut);
}

#[tokio::test]
async fn mcp_session_lost_recovers_and_stage_completes() {
    let llm = ScriptedLlm::new(vec![
        "Thought: check\nAction: kubernetes.get_pods\nAction Input: namespace: prod",
        "Final Answer: pods look unhealthy but recovering",
        "Pods recovering.",
    ]);
    // First tools/call attempt dies with a lost session; the retry on a
    // fresh session succeeds.
    let factory = ScriptedFactory::new(vec![TransportError::Http {
        status: 404,
        message: "session not found".into(),
    }]);
    let stack = build_stack(
        Settings::default(),
        config_with_mcp(),
        llm,
        Arc::clone(&factory),
    );

    let session = submit_and_claim(&stack).await;
    stack.runner.run(session.clone(), None).await;

    let done = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    // Initial session + exactly one re-initialization.
    assert_eq!(factory.init_count.load(Ordering::SeqCst), 2);

    // The observation reflects the successful retry: the loop went on to
    // a final answer and the stage completed normally.
    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages[0].status, StageStatus::Completed);
}

#[tokio::test]
async fn cancel_request_on_paused_session_goes_straight_to_cancelled() {
    let llm = ScriptedLlm::new(vec![
        "Thought: one\nAction: kubernetes.get_pods\nAction Input: namespace: prod",
    ]);
    let factory = ScriptedFactory::new(vec![]);
    let mut settings = Settings::default();
    settings.max_llm_mcp_iterations = 1;
    let stack = build_stack(settings, config_with_mcp(), llm, Arc::clone(&factory));

    let session = submit_and_claim(&stack).await;
    stack.runner.run(session.clone(), None).await;
    let paused = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);

    let status = stack
        .sessions
        .request_cancel(&session.session_id)
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::Cancelled);

    let done = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::Cancelled);
    assert!(done.pause_metadata.is_none());
    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    assert_eq!(stages[0].status, StageStatus::Cancelled);
}

#[tokio::test]
async fn parallel_stage_aggregates_and_feeds_synthesis() {
    let config: Config = serde_json::from_value(serde_json::json!({
        "mcp": {
            "servers": [{"name": "kubernetes", "transport": "stdio", "command": "unused"}]
        },
        "agents": {
            "LogsAgent": {"mcp_servers": ["kubernetes"]},
            "MetricsAgent": {"mcp_servers": ["kubernetes"]}
        },
        "chains": [{
            "chain_id": "k8s-parallel",
            "alert_types": ["kubernetes"],
            "stages": [
                {"id": "investigate", "agents": [
                    {"agent": "LogsAgent"},
                    {"agent": "MetricsAgent"}
                ]},
                {"id": "synthesis", "agent": "SynthesisAgent", "iteration_strategy": "synthesis"}
            ]
        }]
    }))
    .unwrap();

    // Both children answer immediately; then the synthesis call; then the
    // executive summary. (Parallel children race for the first two
    // responses, which are interchangeable here.)
    let llm = ScriptedLlm::new(vec![
        "Final Answer: logs show OOM kills",
        "Final Answer: memory usage at 100%",
        "Unified analysis: the namespace is out of memory",
        "Out of memory; raise quota.",
    ]);
    let factory = ScriptedFactory::new(vec![]);
    let stack = build_stack(Settings::default(), config, llm, Arc::clone(&factory));

    let session = submit_and_claim(&stack).await;
    stack.runner.run(session.clone(), None).await;

    let done = stack
        .store
        .get_session(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.final_analysis.unwrap().contains("out of memory"));

    let stages = stack
        .store
        .get_stage_executions_for_session(&session.session_id)
        .await
        .unwrap();
    // Parent + 2 children + synthesis stage.
    assert_eq!(stages.len(), 4);
    let parent = &stages[0];
    assert_eq!(parent.parallel_index, 0);
    assert_eq!(parent.status, StageStatus::Completed);
    let children: Vec<_> = stages.iter().filter(|s| s.parallel_index > 0).collect();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(
            child.parent_stage_execution_id.as_deref(),
            Some(parent.execution_id.as_str())
        );
        assert_eq!(child.status, StageStatus::Completed);
    }
    // The parent output combines both children under agent headers.
    let combined = parent.stage_output.as_ref().unwrap()["analysis"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(combined.contains("#### LogsAgent"));
    assert!(combined.contains("#### MetricsAgent"));
}
