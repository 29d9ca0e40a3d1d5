//! Chain executor: walks a session's stages, fans out parallel agents,
//! maps controller outcomes to stage/session statuses, and finishes with
//! the executive summary.
//!
//! Status mapping is the one place that decides terminal states:
//! - `AgentError::Paused` → stage PAUSED, session PAUSED, executor
//!   returns without running later stages (and without failing anything).
//! - `AgentError::Cancelled` → CANCELLED when the cancellation tracker
//!   has a user mark for the session, TIMED_OUT otherwise.
//! - anything else → FAILED, later stages not run.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use tarsy_agents::context::{ChainContext, StageContext};
use tarsy_agents::controller::controller_for;
use tarsy_agents::{AgentDefinition, AgentError};
use tarsy_domain::cancel::CancelToken;
use tarsy_domain::chain::{ChainDefinition, ChainStageDefinition};
use tarsy_domain::config::{ExecutionConfig, McpConfig, Settings};
use tarsy_domain::event::{channels, EventPayload, ParallelMetadata};
use tarsy_domain::session::{AlertSession, PauseMetadata, PauseReason};
use tarsy_domain::sink::InteractionSink;
use tarsy_domain::stage::StageExecution;
use tarsy_domain::status::{ParallelType, SessionStatus, StageStatus};
use tarsy_domain::timestamp::now_us;
use tarsy_domain::Result;
use tarsy_events::EventBus;
use tarsy_llm::LlmClient;
use tarsy_mcp::{McpClient, McpRecoveryConfig, TransportFactory};
use tarsy_store::Store;

use crate::cancel::CancellationTracker;
use crate::registry::AgentRegistry;
use crate::resolver::resolve_execution_config;
use crate::summary::{ExecutiveSummarizer, LlmResultSummarizer};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ChainExecutor {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    llm: Arc<LlmClient>,
    mcp_config: Arc<McpConfig>,
    recovery: McpRecoveryConfig,
    agents: Arc<AgentRegistry>,
    settings: Arc<Settings>,
    sink: Arc<dyn InteractionSink>,
    tracker: Arc<CancellationTracker>,
    /// Injectable for tests; `None` means the real transports.
    transport_factory: Option<Arc<dyn TransportFactory>>,
}

/// How a stage aborts the chain walk.
enum StageAbort {
    Paused(PauseMetadata),
    Halt(SessionStatus, String),
}

impl ChainExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        llm: Arc<LlmClient>,
        mcp_config: Arc<McpConfig>,
        recovery: McpRecoveryConfig,
        agents: Arc<AgentRegistry>,
        settings: Arc<Settings>,
        sink: Arc<dyn InteractionSink>,
        tracker: Arc<CancellationTracker>,
    ) -> Self {
        Self {
            store,
            bus,
            llm,
            mcp_config,
            recovery,
            agents,
            settings,
            sink,
            tracker,
            transport_factory: None,
        }
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Execute (or resume) one claimed session to a stopping point:
    /// completion, failure, cancellation, timeout, or pause.
    pub async fn execute_session(
        &self,
        mut session: AlertSession,
        resume: Option<PauseMetadata>,
    ) -> Result<()> {
        let session_id = session.session_id.clone();
        let chain = ChainDefinition::from_value(session.chain_definition.clone())?;
        let token = self.tracker.register(&session_id);

        let mut mcp_client = McpClient::new(
            &session_id,
            Arc::clone(&self.mcp_config),
            session.mcp_selection.clone(),
            self.recovery.clone(),
            Arc::clone(&self.sink),
        )
        .with_summarizer(Arc::new(LlmResultSummarizer::new(
            Arc::clone(&self.llm),
            None,
        )));
        if let Some(factory) = &self.transport_factory {
            mcp_client = mcp_client.with_transport_factory(Arc::clone(factory));
        }
        let mcp = Arc::new(mcp_client);

        if resume.is_none() {
            self.publish(
                channels::SESSIONS,
                EventPayload::SessionStarted {
                    session_id: session_id.clone(),
                    pod_id: session.pod_id.clone().unwrap_or_default(),
                },
            )
            .await;
        }

        let mut chain_ctx = ChainContext::for_session(&session);
        let existing_stages = if resume.is_some() {
            let stages = self.store.get_stage_executions_for_session(&session_id).await?;
            for stage in &stages {
                if let Some(output) = &stage.stage_output {
                    chain_ctx.add_stage_result(&stage.stage_name, &stage.execution_id, output.clone());
                }
            }
            stages
        } else {
            Vec::new()
        };
        let start_index = match &resume {
            Some(_) => session.current_stage_index.unwrap_or(0).max(0) as usize,
            None => 0,
        };

        let outcome = self
            .run_stages(
                &mut session,
                &chain,
                &mut chain_ctx,
                &mcp,
                &token,
                resume,
                &existing_stages,
                start_index,
            )
            .await;

        // Deterministic teardown, whatever happened.
        if let Err(e) = mcp.close().await {
            tracing::warn!(session_id = %session_id, error = %e, "MCP client teardown failed");
        }
        self.tracker.remove(&session_id);

        match outcome {
            Ok(RunOutcome::Completed(final_analysis)) => {
                session.final_analysis = Some(final_analysis.clone());
                let summarizer = ExecutiveSummarizer::new(
                    Arc::clone(&self.llm),
                    self.settings.executive_summary_max_tokens,
                    Duration::from_secs(self.settings.executive_summary_timeout_secs),
                );
                match summarizer.summarize(&session_id, &final_analysis).await {
                    Ok(summary) => session.final_analysis_summary = Some(summary),
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "executive summary failed");
                        session.executive_summary_error = Some(e.to_string());
                    }
                }
                session.finish(SessionStatus::Completed);
                self.store.update_session(&session).await?;
                self.tracker.clear(&session_id);
                self.publish(
                    channels::SESSIONS,
                    EventPayload::SessionCompleted {
                        session_id: session_id.clone(),
                    },
                )
                .await;
                tracing::info!(session_id = %session_id, "session completed");
            }
            Ok(RunOutcome::Paused) => {
                tracing::info!(session_id = %session_id, "session paused");
            }
            Err(abort) => {
                let (status, message) = match abort {
                    StageAbort::Halt(status, message) => (status, message),
                    // A pause that could not be recorded degrades to a
                    // failure so the session never hangs half-written.
                    StageAbort::Paused(_) => (
                        SessionStatus::Failed,
                        "failed to persist pause state".to_string(),
                    ),
                };
                session.error_message = Some(message);
                session.finish(status);
                self.store.update_session(&session).await?;
                self.tracker.clear(&session_id);
                if let Some(payload) = EventPayload::for_terminal_status(&session_id, status) {
                    self.publish(channels::SESSIONS, payload).await;
                }
                tracing::info!(session_id = %session_id, status = %status, "session finished");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        session: &mut AlertSession,
        chain: &ChainDefinition,
        chain_ctx: &mut ChainContext,
        mcp: &Arc<McpClient>,
        token: &CancelToken,
        mut resume: Option<PauseMetadata>,
        existing_stages: &[StageExecution],
        start_index: usize,
    ) -> std::result::Result<RunOutcome, StageAbort> {
        let mut final_analysis = String::new();

        for (index, stage_def) in chain.stages.iter().enumerate().skip(start_index) {
            session.current_stage_index = Some(index as i32);
            session.current_stage_id = Some(stage_def.id.clone());
            if let Err(e) = self.store.update_session(session).await {
                return Err(StageAbort::Halt(SessionStatus::Failed, e.to_string()));
            }

            let stage_resume = resume.take();
            let result = if stage_def.is_parallel() {
                self.run_parallel_stage(
                    session, chain, stage_def, index, chain_ctx, mcp, token, stage_resume,
                    existing_stages,
                )
                .await
            } else {
                self.run_single_stage(
                    session, chain, stage_def, index, chain_ctx, mcp, token, stage_resume,
                    existing_stages,
                )
                .await
            };

            match result {
                Ok(analysis) => final_analysis = analysis,
                Err(StageAbort::Paused(mut pause)) => {
                    pause.stage_id = Some(stage_def.id.clone());
                    session.status = SessionStatus::Paused;
                    session.pause_metadata = Some(pause);
                    if let Err(e) = self.store.update_session(session).await {
                        return Err(StageAbort::Halt(SessionStatus::Failed, e.to_string()));
                    }
                    self.publish(
                        channels::SESSIONS,
                        EventPayload::SessionPaused {
                            session_id: session.session_id.clone(),
                        },
                    )
                    .await;
                    return Ok(RunOutcome::Paused);
                }
                Err(halt) => return Err(halt),
            }
        }

        Ok(RunOutcome::Completed(final_analysis))
    }

    // ── single-agent stage ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_single_stage(
        &self,
        session: &AlertSession,
        chain: &ChainDefinition,
        stage_def: &ChainStageDefinition,
        index: usize,
        chain_ctx: &mut ChainContext,
        mcp: &Arc<McpClient>,
        token: &CancelToken,
        resume: Option<PauseMetadata>,
        existing_stages: &[StageExecution],
    ) -> std::result::Result<String, StageAbort> {
        let agent_name = stage_def.agent.as_deref().unwrap_or_default();
        let agent = self
            .agents
            .resolve(agent_name)
            .map_err(|e| StageAbort::Halt(SessionStatus::Failed, e.to_string()))?;
        let config = resolve_execution_config(
            &self.settings,
            &agent,
            self.agents.config(agent_name),
            chain,
            stage_def,
            None,
        );

        let mut row = match find_resumable(existing_stages, index as i32, 0) {
            Some(paused) => self.reactivate_stage(paused).await?,
            None => {
                self.create_stage(
                    session, stage_def, index, &agent, &config, None, 0, ParallelType::Single,
                )
                .await?
            }
        };

        let (resume_conversation, resume_iteration) = extract_resume(&resume, &row.execution_id);
        let (outcome, iterations) = self
            .drive_controller(
                session, &agent, config, &row, chain_ctx, mcp, token, None,
                resume_conversation, resume_iteration,
            )
            .await;
        if iterations > 0 {
            row.current_iteration = Some(iterations);
        }

        self.settle_stage(&mut row, chain_ctx, stage_def.display_name(), outcome)
            .await
    }

    // ── parallel stage ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel_stage(
        &self,
        session: &AlertSession,
        chain: &ChainDefinition,
        stage_def: &ChainStageDefinition,
        index: usize,
        chain_ctx: &mut ChainContext,
        mcp: &Arc<McpClient>,
        token: &CancelToken,
        resume: Option<PauseMetadata>,
        existing_stages: &[StageExecution],
    ) -> std::result::Result<String, StageAbort> {
        // Child specs: explicit agent list, or N replicas of one agent.
        let specs: Vec<(String, Option<usize>)> = if !stage_def.agents.is_empty() {
            stage_def
                .agents
                .iter()
                .enumerate()
                .map(|(i, a)| (a.agent.clone(), Some(i)))
                .collect()
        } else {
            let agent = stage_def.agent.clone().unwrap_or_default();
            (0..stage_def.replicas.unwrap_or(1))
                .map(|_| (agent.clone(), None))
                .collect()
        };
        let parallel_type = if stage_def.agents.is_empty() {
            ParallelType::Replica
        } else {
            ParallelType::MultiAgent
        };

        // Parent row: parallel_index 0.
        let parent_agent = AgentDefinition {
            name: "parallel".into(),
            mcp_servers: Vec::new(),
            custom_instructions: None,
            iteration_strategy: stage_def.iteration_strategy.unwrap_or_default(),
        };
        let parent_config = resolve_execution_config(
            &self.settings,
            &parent_agent,
            None,
            chain,
            stage_def,
            None,
        );
        let mut parent = match find_resumable(existing_stages, index as i32, 0) {
            Some(paused) => self.reactivate_stage(paused).await?,
            None => {
                self.create_stage(
                    session, stage_def, index, &parent_agent, &parent_config, None, 0,
                    parallel_type,
                )
                .await?
            }
        };

        // Children run concurrently; each settles its own row.
        let mut join_set: JoinSet<(StageExecution, std::result::Result<String, AgentError>)> =
            JoinSet::new();
        for (child_index, (agent_name, parallel_slot)) in specs.iter().enumerate() {
            let parallel_index = (child_index + 1) as i32;

            // On resume, completed children stay done; only paused/active
            // children run again.
            if let Some(existing) = find_stage(existing_stages, index as i32, parallel_index) {
                if existing.status.is_terminal() {
                    continue;
                }
            }

            let agent = self
                .agents
                .resolve(agent_name)
                .map_err(|e| StageAbort::Halt(SessionStatus::Failed, e.to_string()))?;
            let parallel_def = parallel_slot.map(|i| &stage_def.agents[i]);
            let config = resolve_execution_config(
                &self.settings,
                &agent,
                self.agents.config(agent_name),
                chain,
                stage_def,
                parallel_def,
            );

            let row = match find_resumable(existing_stages, index as i32, parallel_index) {
                Some(paused) => self.reactivate_stage(paused).await?,
                None => {
                    self.create_stage(
                        session, stage_def, index, &agent, &config,
                        Some(parent.execution_id.clone()), parallel_index, parallel_type,
                    )
                    .await?
                }
            };

            let metadata = ParallelMetadata {
                parent_stage_execution_id: parent.execution_id.clone(),
                parallel_index,
                agent_name: agent.name.clone(),
            };
            let (resume_conversation, resume_iteration) = extract_resume(&resume, &row.execution_id);

            let executor = self.clone();
            let session = session.clone();
            let chain_snapshot = chain_ctx.clone();
            let mcp = Arc::clone(mcp);
            let token = token.clone();
            join_set.spawn(async move {
                let mut chain_snapshot = chain_snapshot;
                let (outcome, iterations) = executor
                    .drive_controller(
                        &session, &agent, config, &row, &mut chain_snapshot, &mcp, &token,
                        Some(metadata), resume_conversation, resume_iteration,
                    )
                    .await;
                let mut row = row;
                if iterations > 0 {
                    row.current_iteration = Some(iterations);
                }
                (row, outcome)
            });
        }

        let mut children: Vec<(StageExecution, std::result::Result<String, AgentError>)> =
            Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => children.push(entry),
                Err(e) => {
                    return Err(StageAbort::Halt(
                        SessionStatus::Failed,
                        format!("parallel child task panicked: {e}"),
                    ))
                }
            }
        }
        children.sort_by_key(|(row, _)| row.parallel_index);

        self.settle_parallel(
            &mut parent,
            children,
            chain_ctx,
            stage_def.display_name(),
            existing_stages,
            index as i32,
        )
        .await
    }

    /// Update child rows, aggregate the parent status, and either produce
    /// the combined output or the abort.
    async fn settle_parallel(
        &self,
        parent: &mut StageExecution,
        children: Vec<(StageExecution, std::result::Result<String, AgentError>)>,
        chain_ctx: &mut ChainContext,
        stage_name: &str,
        existing_stages: &[StageExecution],
        stage_index: i32,
    ) -> std::result::Result<String, StageAbort> {
        let mut statuses = Vec::new();
        let mut combined = String::new();
        let mut pause_conversations = std::collections::HashMap::new();
        let mut pause_iteration = None;
        let mut first_error = None;

        // Children finished in an earlier run (resume path) still count
        // toward aggregation.
        for stage in existing_stages {
            if stage.stage_index == stage_index
                && stage.parallel_index > 0
                && stage.status.is_terminal()
            {
                statuses.push(stage.status);
                if let Some(output) = &stage.stage_output {
                    append_child_output(&mut combined, &stage.agent, output);
                    chain_ctx.add_stage_result(stage_name, &stage.execution_id, output.clone());
                }
            }
        }

        for (mut row, outcome) in children {
            match outcome {
                Ok(analysis) => {
                    let output = serde_json::json!({"analysis": analysis, "agent": row.agent});
                    row.complete(output.clone());
                    self.persist_stage(&row).await?;
                    self.sink.on_stage_event(row.clone()).await;
                    append_child_output(&mut combined, &row.agent, &output);
                    chain_ctx.add_stage_result(stage_name, &row.execution_id, output);
                    statuses.push(StageStatus::Completed);
                }
                Err(AgentError::Paused(capture)) => {
                    row.status = StageStatus::Paused;
                    row.paused_at_us = Some(now_us());
                    row.current_iteration = Some(capture.current_iteration);
                    self.persist_stage(&row).await?;
                    pause_iteration = Some(capture.current_iteration);
                    pause_conversations.insert(row.execution_id.clone(), capture.conversation);
                    statuses.push(StageStatus::Paused);
                }
                Err(AgentError::Cancelled) => {
                    let status = self.cancel_status(&row.session_id);
                    row.fail(status, "stage cancelled");
                    self.persist_stage(&row).await?;
                    self.sink.on_stage_event(row.clone()).await;
                    statuses.push(status);
                }
                Err(AgentError::Failed(e)) => {
                    row.fail(StageStatus::Failed, e.to_string());
                    self.persist_stage(&row).await?;
                    self.sink.on_stage_event(row.clone()).await;
                    first_error.get_or_insert_with(|| e.to_string());
                    statuses.push(StageStatus::Failed);
                }
            }
        }

        let aggregated = aggregate_parallel_status(&statuses);
        match aggregated {
            StageStatus::Paused => {
                parent.status = StageStatus::Paused;
                parent.paused_at_us = Some(now_us());
                parent.current_iteration = pause_iteration;
                self.persist_stage(parent).await?;
                Err(StageAbort::Paused(PauseMetadata {
                    reason: PauseReason::MaxIterationsReached,
                    message: format!(
                        "paused after {} iterations",
                        pause_iteration.unwrap_or_default()
                    ),
                    current_iteration: pause_iteration,
                    paused_at_us: now_us(),
                    stage_id: Some(parent.stage_id.clone()),
                    conversations: pause_conversations,
                }))
            }
            StageStatus::Completed | StageStatus::Partial => {
                let failed: Vec<String> = statuses
                    .iter()
                    .filter(|s| s.is_error())
                    .map(|s| s.to_string())
                    .collect();
                let mut output = serde_json::json!({"analysis": combined});
                if !failed.is_empty() {
                    output["failed_children"] = serde_json::json!(failed.len());
                }
                parent.status = aggregated;
                parent.stage_output = Some(output.clone());
                let now = now_us();
                parent.completed_at_us = Some(now);
                if let Some(started) = parent.started_at_us {
                    parent.duration_ms = Some((now - started).max(0) / 1_000);
                }
                self.persist_stage(parent).await?;
                self.sink.on_stage_event(parent.clone()).await;
                chain_ctx.add_stage_result(stage_name, &parent.execution_id, output);
                Ok(combined)
            }
            StageStatus::Cancelled | StageStatus::TimedOut => {
                parent.fail(aggregated, "parallel stage cancelled");
                self.persist_stage(parent).await?;
                self.sink.on_stage_event(parent.clone()).await;
                let session_status = if aggregated == StageStatus::Cancelled {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::TimedOut
                };
                Err(StageAbort::Halt(session_status, "session cancelled".into()))
            }
            _ => {
                let message =
                    first_error.unwrap_or_else(|| "all parallel children failed".to_string());
                parent.fail(StageStatus::Failed, message.clone());
                self.persist_stage(parent).await?;
                self.sink.on_stage_event(parent.clone()).await;
                Err(StageAbort::Halt(SessionStatus::Failed, message))
            }
        }
    }

    // ── shared stage plumbing ──────────────────────────────────────

    /// Build the stage context and run the controller under the stage
    /// timeout.
    #[allow(clippy::too_many_arguments)]
    async fn drive_controller(
        &self,
        session: &AlertSession,
        agent: &AgentDefinition,
        config: ExecutionConfig,
        row: &StageExecution,
        chain_ctx: &mut ChainContext,
        mcp: &Arc<McpClient>,
        token: &CancelToken,
        parallel: Option<ParallelMetadata>,
        resume_conversation: Option<tarsy_domain::conversation::Conversation>,
        resume_iteration: Option<u32>,
    ) -> (std::result::Result<String, AgentError>, u32) {
        let controller = controller_for(config.iteration_strategy);

        let mut available_tools = Vec::new();
        if controller.needs_mcp_tools() {
            // Alert-level MCP selection always wins over the resolved list.
            let servers = match &session.mcp_selection {
                Some(selection) if !selection.servers.is_empty() => selection.server_names(),
                _ => config.mcp_servers.clone(),
            };
            for server in servers {
                match mcp.list_tools(&server, Some(&row.execution_id)).await {
                    Ok(tools) => {
                        available_tools
                            .extend(tools.into_iter().map(|t| (server.clone(), t)));
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session.session_id,
                            server = %server,
                            error = %e,
                            "tool discovery failed, continuing without this server"
                        );
                    }
                }
            }
        }

        let mut ctx = StageContext {
            session_id: session.session_id.clone(),
            execution_id: row.execution_id.clone(),
            stage_id: row.stage_id.clone(),
            stage_name: row.stage_name.clone(),
            agent: agent.clone(),
            config: config.clone(),
            chain: chain_ctx.clone(),
            available_tools,
            llm: Arc::clone(&self.llm),
            mcp: Arc::clone(mcp),
            cancel: token.clone(),
            parallel,
            resume_conversation,
            resume_iteration,
            current_iteration: 0,
        };

        let stage_timeout = Duration::from_secs(
            self.settings.llm_iteration_timeout_secs * config.max_iterations.max(1) as u64,
        );
        let outcome =
            match tokio::time::timeout(stage_timeout, controller.execute_analysis_loop(&mut ctx))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        stage_id = %row.stage_id,
                        timeout_secs = stage_timeout.as_secs(),
                        "stage timed out"
                    );
                    token.cancel();
                    Err(AgentError::Cancelled)
                }
            };
        (outcome, ctx.current_iteration)
    }

    /// Map a single-stage controller outcome onto the stage row and chain
    /// context.
    async fn settle_stage(
        &self,
        row: &mut StageExecution,
        chain_ctx: &mut ChainContext,
        stage_name: &str,
        outcome: std::result::Result<String, AgentError>,
    ) -> std::result::Result<String, StageAbort> {
        match outcome {
            Ok(analysis) => {
                let output = serde_json::json!({"analysis": analysis});
                row.complete(output.clone());
                self.persist_stage(row).await?;
                self.sink.on_stage_event(row.clone()).await;
                chain_ctx.add_stage_result(stage_name, &row.execution_id, output);
                Ok(analysis)
            }
            Err(AgentError::Paused(capture)) => {
                let paused_at = now_us();
                row.status = StageStatus::Paused;
                row.paused_at_us = Some(paused_at);
                row.current_iteration = Some(capture.current_iteration);
                self.persist_stage(row).await?;
                let mut conversations = std::collections::HashMap::new();
                conversations.insert(row.execution_id.clone(), capture.conversation);
                Err(StageAbort::Paused(PauseMetadata {
                    reason: PauseReason::MaxIterationsReached,
                    message: format!("paused after {} iterations", capture.current_iteration),
                    current_iteration: Some(capture.current_iteration),
                    paused_at_us: paused_at,
                    stage_id: Some(row.stage_id.clone()),
                    conversations,
                }))
            }
            Err(AgentError::Cancelled) => {
                let status = self.cancel_status(&row.session_id);
                row.fail(status, "stage cancelled");
                self.persist_stage(row).await?;
                self.sink.on_stage_event(row.clone()).await;
                let session_status = if status == StageStatus::Cancelled {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::TimedOut
                };
                Err(StageAbort::Halt(session_status, "session cancelled".into()))
            }
            Err(AgentError::Failed(e)) => {
                row.fail(StageStatus::Failed, e.to_string());
                self.persist_stage(row).await?;
                self.sink.on_stage_event(row.clone()).await;
                Err(StageAbort::Halt(SessionStatus::Failed, e.to_string()))
            }
        }
    }

    /// CANCELLED vs TIMED_OUT, decided by the tracker alone.
    fn cancel_status(&self, session_id: &str) -> StageStatus {
        if self.tracker.is_user_cancel(session_id) {
            StageStatus::Cancelled
        } else {
            StageStatus::TimedOut
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_stage(
        &self,
        session: &AlertSession,
        stage_def: &ChainStageDefinition,
        index: usize,
        agent: &AgentDefinition,
        config: &ExecutionConfig,
        parent_execution_id: Option<String>,
        parallel_index: i32,
        parallel_type: ParallelType,
    ) -> std::result::Result<StageExecution, StageAbort> {
        let mut row = StageExecution::started(
            &session.session_id,
            &stage_def.id,
            index as i32,
            stage_def.display_name(),
            &agent.name,
            config.iteration_strategy,
        );
        row.parent_stage_execution_id = parent_execution_id;
        row.parallel_index = parallel_index;
        row.parallel_type = parallel_type;
        self.store
            .create_stage_execution(&row)
            .await
            .map_err(|e| StageAbort::Halt(SessionStatus::Failed, e.to_string()))?;
        self.sink.on_stage_event(row.clone()).await;
        Ok(row)
    }

    /// Bring a paused row back to ACTIVE, shifting `started_at_us` so the
    /// paused interval does not count into `duration_ms`.
    async fn reactivate_stage(
        &self,
        paused: &StageExecution,
    ) -> std::result::Result<StageExecution, StageAbort> {
        let mut row = paused.clone();
        if let Some(paused_at) = row.paused_at_us.take() {
            let pause_len = now_us() - paused_at;
            row.started_at_us = row.started_at_us.map(|s| s + pause_len);
        }
        row.status = StageStatus::Active;
        self.persist_stage(&row).await?;
        Ok(row)
    }

    async fn persist_stage(&self, row: &StageExecution) -> std::result::Result<(), StageAbort> {
        self.store
            .update_stage_execution(row)
            .await
            .map_err(|e| StageAbort::Halt(SessionStatus::Failed, e.to_string()))
    }

    async fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(e) = self.bus.publish(channel, &payload).await {
            tracing::warn!(channel, error = %e, "event publish failed");
        }
    }
}

enum RunOutcome {
    Completed(String),
    Paused,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn find_stage<'a>(
    stages: &'a [StageExecution],
    stage_index: i32,
    parallel_index: i32,
) -> Option<&'a StageExecution> {
    stages
        .iter()
        .find(|s| s.stage_index == stage_index && s.parallel_index == parallel_index)
}

fn find_resumable<'a>(
    stages: &'a [StageExecution],
    stage_index: i32,
    parallel_index: i32,
) -> Option<&'a StageExecution> {
    find_stage(stages, stage_index, parallel_index)
        .filter(|s| matches!(s.status, StageStatus::Paused | StageStatus::Active))
}

fn extract_resume(
    resume: &Option<PauseMetadata>,
    execution_id: &str,
) -> (Option<tarsy_domain::conversation::Conversation>, Option<u32>) {
    match resume {
        Some(meta) => (
            meta.conversations.get(execution_id).cloned(),
            meta.current_iteration,
        ),
        None => (None, None),
    }
}

fn append_child_output(combined: &mut String, agent: &str, output: &serde_json::Value) {
    let text = output
        .get("analysis")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !combined.is_empty() {
        combined.push_str("\n\n");
    }
    combined.push_str(&format!("#### {agent}\n{text}"));
}

/// Parent status from child statuses, per the aggregation rules:
/// paused > cancelled > timed_out > completed-iff-all > partial > failed.
pub fn aggregate_parallel_status(children: &[StageStatus]) -> StageStatus {
    if children.is_empty() {
        return StageStatus::Failed;
    }
    if children.contains(&StageStatus::Paused) {
        return StageStatus::Paused;
    }
    if children.contains(&StageStatus::Cancelled) {
        return StageStatus::Cancelled;
    }
    if children.contains(&StageStatus::TimedOut) {
        return StageStatus::TimedOut;
    }
    let completed = children
        .iter()
        .filter(|s| **s == StageStatus::Completed)
        .count();
    if completed == children.len() {
        StageStatus::Completed
    } else if completed > 0 {
        StageStatus::Partial
    } else {
        StageStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_all_completed() {
        assert_eq!(
            aggregate_parallel_status(&[StageStatus::Completed, StageStatus::Completed]),
            StageStatus::Completed
        );
    }

    #[test]
    fn aggregation_mixed_is_partial() {
        assert_eq!(
            aggregate_parallel_status(&[StageStatus::Completed, StageStatus::Failed]),
            StageStatus::Partial
        );
    }

    #[test]
    fn aggregation_all_failed() {
        assert_eq!(
            aggregate_parallel_status(&[StageStatus::Failed, StageStatus::Failed]),
            StageStatus::Failed
        );
    }

    #[test]
    fn aggregation_cancelled_dominates_failed() {
        assert_eq!(
            aggregate_parallel_status(&[
                StageStatus::Failed,
                StageStatus::Cancelled,
                StageStatus::Completed
            ]),
            StageStatus::Cancelled
        );
        assert_eq!(
            aggregate_parallel_status(&[StageStatus::TimedOut, StageStatus::Failed]),
            StageStatus::TimedOut
        );
    }

    #[test]
    fn aggregation_paused_dominates_everything() {
        assert_eq!(
            aggregate_parallel_status(&[
                StageStatus::Completed,
                StageStatus::Cancelled,
                StageStatus::Paused
            ]),
            StageStatus::Paused
        );
    }

    #[test]
    fn aggregation_empty_is_failed() {
        assert_eq!(aggregate_parallel_status(&[]), StageStatus::Failed);
    }
}
