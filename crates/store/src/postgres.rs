//! Postgres store implementation (sqlx).
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single statement so two
//! replicas can never claim the same session; the cancel transition is a
//! conditional UPDATE gated on the active status set. JSON-shaped fields
//! (alert data, chain snapshot, conversations, pause metadata) live in
//! JSONB columns.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};

use tarsy_domain::error::Error;
use tarsy_domain::event::Event;
use tarsy_domain::interaction::{LlmInteraction, McpInteraction};
use tarsy_domain::session::AlertSession;
use tarsy_domain::stage::StageExecution;
use tarsy_domain::status::SessionStatus;
use tarsy_domain::timestamp::now_us;
use tarsy_domain::Result;

use crate::retry::{map_sqlx_error, with_retry};
use crate::{check_session_invariants, SessionFilter, Store};

/// Active statuses as a SQL literal list, kept in one place.
const ACTIVE_STATUSES_SQL: &str = "('pending', 'in_progress', 'paused', 'canceling')";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("connect: {e}")))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS alert_sessions (
                session_id TEXT PRIMARY KEY,
                alert_id TEXT NOT NULL UNIQUE,
                alert_type TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                alert_data JSONB NOT NULL DEFAULT '{}'::jsonb,
                chain_id TEXT NOT NULL,
                chain_definition JSONB NOT NULL DEFAULT '{}'::jsonb,
                author TEXT NOT NULL,
                runbook_url TEXT,
                mcp_selection JSONB,
                status TEXT NOT NULL,
                pod_id TEXT,
                last_interaction_at_us BIGINT,
                started_at_us BIGINT NOT NULL,
                completed_at_us BIGINT,
                current_stage_index INT,
                current_stage_id TEXT,
                error_message TEXT,
                final_analysis TEXT,
                final_analysis_summary TEXT,
                executive_summary_error TEXT,
                pause_metadata JSONB
            )"#,
            "CREATE INDEX IF NOT EXISTS ix_alert_sessions_status_started
                ON alert_sessions (status, started_at_us)",
            "CREATE INDEX IF NOT EXISTS ix_alert_sessions_alert_type
                ON alert_sessions (alert_type)",
            r#"CREATE TABLE IF NOT EXISTS stage_executions (
                execution_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES alert_sessions(session_id) ON DELETE CASCADE,
                stage_id TEXT NOT NULL,
                stage_index INT NOT NULL,
                stage_name TEXT NOT NULL,
                agent TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at_us BIGINT,
                completed_at_us BIGINT,
                paused_at_us BIGINT,
                duration_ms BIGINT,
                current_iteration INT,
                iteration_strategy TEXT,
                stage_output JSONB,
                error_message TEXT,
                parent_stage_execution_id TEXT,
                parallel_index INT NOT NULL DEFAULT 0,
                parallel_type TEXT NOT NULL DEFAULT 'single',
                UNIQUE (session_id, stage_index, parallel_index)
            )"#,
            "CREATE INDEX IF NOT EXISTS ix_stage_executions_session
                ON stage_executions (session_id, stage_index)",
            r#"CREATE TABLE IF NOT EXISTS llm_interactions (
                interaction_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES alert_sessions(session_id) ON DELETE CASCADE,
                stage_execution_id TEXT,
                timestamp_us BIGINT NOT NULL,
                conversation JSONB NOT NULL,
                model_name TEXT NOT NULL,
                provider TEXT NOT NULL,
                interaction_type TEXT NOT NULL,
                response_metadata JSONB,
                native_tools_config JSONB,
                thinking_content TEXT,
                mcp_event_id TEXT,
                duration_ms BIGINT NOT NULL,
                step_description TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS ix_llm_interactions_session
                ON llm_interactions (session_id, timestamp_us)",
            r#"CREATE TABLE IF NOT EXISTS mcp_interactions (
                request_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES alert_sessions(session_id) ON DELETE CASCADE,
                stage_execution_id TEXT,
                timestamp_us BIGINT NOT NULL,
                server_name TEXT NOT NULL,
                communication_type TEXT NOT NULL,
                tool_name TEXT,
                tool_arguments JSONB,
                tool_result JSONB,
                available_tools JSONB,
                duration_ms BIGINT NOT NULL,
                success BOOLEAN NOT NULL,
                error_message TEXT
            )"#,
            "CREATE INDEX IF NOT EXISTS ix_mcp_interactions_session
                ON mcp_interactions (session_id, timestamp_us)",
            r#"CREATE TABLE IF NOT EXISTS events (
                id BIGSERIAL PRIMARY KEY,
                channel TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at_us BIGINT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS ix_events_channel_id ON events (channel, id)",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enum/JSON column helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize a serde unit-variant enum to its bare string form for a TEXT
/// column (`InteractionType::FinalAnswer` → `"final_answer"`).
fn enum_to_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(Error::Other(format!(
            "expected string-serializable enum, got {other}"
        ))),
    }
}

fn enum_from_str<T: serde::de::DeserializeOwned>(context: &str, s: &str) -> Result<T> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|e| Error::Other(format!("{context}: unknown value '{s}': {e}")))
}

fn opt_enum_to_str<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(enum_to_str).transpose()
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<Value>> {
    value
        .as_ref()
        .map(|v| serde_json::to_value(v).map_err(Error::from))
        .transpose()
}

fn session_from_row(row: &PgRow) -> Result<AlertSession> {
    let status: String = row.try_get("status").map_err(|e| map_sqlx_error("session.status", e))?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| Error::Other(format!("unknown session status '{status}'")))?;
    let mcp_selection: Option<Value> = row.try_get("mcp_selection").ok().flatten();
    let pause_metadata: Option<Value> = row.try_get("pause_metadata").ok().flatten();
    Ok(AlertSession {
        session_id: get(row, "session_id")?,
        alert_id: get(row, "alert_id")?,
        alert_type: get(row, "alert_type")?,
        agent_type: get(row, "agent_type")?,
        alert_data: get(row, "alert_data")?,
        chain_id: get(row, "chain_id")?,
        chain_definition: get(row, "chain_definition")?,
        author: get(row, "author")?,
        runbook_url: get(row, "runbook_url")?,
        mcp_selection: mcp_selection.map(serde_json::from_value).transpose()?,
        status,
        pod_id: get(row, "pod_id")?,
        last_interaction_at_us: get(row, "last_interaction_at_us")?,
        started_at_us: get(row, "started_at_us")?,
        completed_at_us: get(row, "completed_at_us")?,
        current_stage_index: get(row, "current_stage_index")?,
        current_stage_id: get(row, "current_stage_id")?,
        error_message: get(row, "error_message")?,
        final_analysis: get(row, "final_analysis")?,
        final_analysis_summary: get(row, "final_analysis_summary")?,
        executive_summary_error: get(row, "executive_summary_error")?,
        pause_metadata: pause_metadata.map(serde_json::from_value).transpose()?,
    })
}

fn stage_from_row(row: &PgRow) -> Result<StageExecution> {
    let status: String = get(row, "status")?;
    let strategy: Option<String> = get(row, "iteration_strategy")?;
    let parallel_type: String = get(row, "parallel_type")?;
    Ok(StageExecution {
        execution_id: get(row, "execution_id")?,
        session_id: get(row, "session_id")?,
        stage_id: get(row, "stage_id")?,
        stage_index: get(row, "stage_index")?,
        stage_name: get(row, "stage_name")?,
        agent: get(row, "agent")?,
        status: enum_from_str("stage.status", &status)?,
        started_at_us: get(row, "started_at_us")?,
        completed_at_us: get(row, "completed_at_us")?,
        paused_at_us: get(row, "paused_at_us")?,
        duration_ms: get(row, "duration_ms")?,
        current_iteration: get::<Option<i32>>(row, "current_iteration")?.map(|v| v as u32),
        iteration_strategy: strategy
            .map(|s| enum_from_str("stage.iteration_strategy", &s))
            .transpose()?,
        stage_output: get(row, "stage_output")?,
        error_message: get(row, "error_message")?,
        parent_stage_execution_id: get(row, "parent_stage_execution_id")?,
        parallel_index: get(row, "parallel_index")?,
        parallel_type: enum_from_str("stage.parallel_type", &parallel_type)?,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| map_sqlx_error(&format!("column {column}"), e))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl Store for PgStore {
    async fn create_session(&self, session: &AlertSession) -> Result<()> {
        let mcp_selection = opt_json(&session.mcp_selection)?;
        let pause_metadata = opt_json(&session.pause_metadata)?;
        with_retry("create_session", || async {
            sqlx::query(
                r#"INSERT INTO alert_sessions (
                    session_id, alert_id, alert_type, agent_type, alert_data,
                    chain_id, chain_definition, author, runbook_url, mcp_selection,
                    status, pod_id, last_interaction_at_us, started_at_us,
                    completed_at_us, current_stage_index, current_stage_id,
                    error_message, final_analysis, final_analysis_summary,
                    executive_summary_error, pause_metadata
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)"#,
            )
            .bind(&session.session_id)
            .bind(&session.alert_id)
            .bind(&session.alert_type)
            .bind(&session.agent_type)
            .bind(&session.alert_data)
            .bind(&session.chain_id)
            .bind(&session.chain_definition)
            .bind(&session.author)
            .bind(&session.runbook_url)
            .bind(&mcp_selection)
            .bind(session.status.as_str())
            .bind(&session.pod_id)
            .bind(session.last_interaction_at_us)
            .bind(session.started_at_us)
            .bind(session.completed_at_us)
            .bind(session.current_stage_index)
            .bind(&session.current_stage_id)
            .bind(&session.error_message)
            .bind(&session.final_analysis)
            .bind(&session.final_analysis_summary)
            .bind(&session.executive_summary_error)
            .bind(&pause_metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_session", e))?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<AlertSession>> {
        let row = with_retry("get_session", || async {
            sqlx::query("SELECT * FROM alert_sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_session", e))
        })
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn update_session(&self, session: &AlertSession) -> Result<()> {
        check_session_invariants(session)?;
        let mcp_selection = opt_json(&session.mcp_selection)?;
        let pause_metadata = opt_json(&session.pause_metadata)?;
        let updated = with_retry("update_session", || async {
            sqlx::query(
                r#"UPDATE alert_sessions SET
                    status = $2, pod_id = $3, last_interaction_at_us = $4,
                    completed_at_us = $5, current_stage_index = $6,
                    current_stage_id = $7, error_message = $8,
                    final_analysis = $9, final_analysis_summary = $10,
                    executive_summary_error = $11, pause_metadata = $12,
                    mcp_selection = $13
                WHERE session_id = $1"#,
            )
            .bind(&session.session_id)
            .bind(session.status.as_str())
            .bind(&session.pod_id)
            .bind(session.last_interaction_at_us)
            .bind(session.completed_at_us)
            .bind(session.current_stage_index)
            .bind(&session.current_stage_id)
            .bind(&session.error_message)
            .bind(&session.final_analysis)
            .bind(&session.final_analysis_summary)
            .bind(&session.executive_summary_error)
            .bind(&pause_metadata)
            .bind(&mcp_selection)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_session", e))
        })
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("session {}", session.session_id)));
        }
        Ok(())
    }

    async fn claim_next_pending_session(&self, pod_id: &str) -> Result<Option<AlertSession>> {
        let now = now_us();
        let row = with_retry("claim_next_pending_session", || async {
            sqlx::query(
                r#"WITH next AS (
                    SELECT session_id FROM alert_sessions
                    WHERE status = 'pending'
                    ORDER BY started_at_us ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE alert_sessions s
                SET status = 'in_progress', pod_id = $1, last_interaction_at_us = $2
                FROM next
                WHERE s.session_id = next.session_id
                RETURNING s.*"#,
            )
            .bind(pod_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next_pending_session", e))
        })
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn touch_session(&self, session_id: &str, at_us: i64) -> Result<()> {
        let updated = with_retry("touch_session", || async {
            sqlx::query("UPDATE alert_sessions SET last_interaction_at_us = $2 WHERE session_id = $1")
                .bind(session_id)
                .bind(at_us)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("touch_session", e))
        })
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn count_pending_sessions(&self) -> Result<u64> {
        self.count_sessions_by_status(SessionStatus::Pending).await
    }

    async fn count_sessions_by_status(&self, status: SessionStatus) -> Result<u64> {
        let count: i64 = with_retry("count_sessions_by_status", || async {
            sqlx::query_scalar("SELECT COUNT(*) FROM alert_sessions WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_sessions_by_status", e))
        })
        .await?;
        Ok(count as u64)
    }

    async fn update_session_to_canceling(
        &self,
        session_id: &str,
    ) -> Result<(bool, SessionStatus)> {
        let sql = format!(
            "UPDATE alert_sessions SET status = 'canceling'
             WHERE session_id = $1 AND status IN {ACTIVE_STATUSES_SQL}
             RETURNING status"
        );
        let updated: Option<String> = with_retry("update_session_to_canceling", || async {
            sqlx::query_scalar(&sql)
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_session_to_canceling", e))
        })
        .await?;
        if updated.is_some() {
            return Ok((true, SessionStatus::Canceling));
        }
        // No transition: report the current status (or NotFound).
        let current: Option<String> = with_retry("get_session_status", || async {
            sqlx::query_scalar("SELECT status FROM alert_sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_session_status", e))
        })
        .await?;
        let current = current.ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let status = SessionStatus::parse(&current)
            .ok_or_else(|| Error::Other(format!("unknown session status '{current}'")))?;
        Ok((false, status))
    }

    async fn get_active_sessions(&self) -> Result<Vec<AlertSession>> {
        let sql = format!("SELECT * FROM alert_sessions WHERE status IN {ACTIVE_STATUSES_SQL}");
        let rows = with_retry("get_active_sessions", || async {
            sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_active_sessions", e))
        })
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<(Vec<AlertSession>, u64)> {
        fn apply_filters<'a>(
            builder: &mut QueryBuilder<'a, sqlx::Postgres>,
            filter: &'a SessionFilter,
        ) {
            builder.push(" WHERE TRUE");
            if let Some(status) = filter.status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(agent_type) = &filter.agent_type {
                builder.push(" AND agent_type = ").push_bind(agent_type);
            }
            if let Some(alert_type) = &filter.alert_type {
                builder.push(" AND alert_type = ").push_bind(alert_type);
            }
            if let Some(after) = filter.started_after_us {
                builder.push(" AND started_at_us >= ").push_bind(after);
            }
            if let Some(before) = filter.started_before_us {
                builder.push(" AND started_at_us < ").push_bind(before);
            }
        }

        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM alert_sessions");
        apply_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_sessions.count", e))?;

        let mut page_builder = QueryBuilder::new("SELECT * FROM alert_sessions");
        apply_filters(&mut page_builder, filter);
        page_builder
            .push(" ORDER BY started_at_us DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);
        let rows = page_builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_sessions.page", e))?;
        let sessions = rows.iter().map(session_from_row).collect::<Result<_>>()?;
        Ok((sessions, total as u64))
    }

    async fn delete_sessions_older_than(&self, cutoff_us: i64) -> Result<u64> {
        let result = with_retry("delete_sessions_older_than", || async {
            sqlx::query("DELETE FROM alert_sessions WHERE started_at_us < $1")
                .bind(cutoff_us)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_sessions_older_than", e))
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_stage_execution(&self, stage: &StageExecution) -> Result<()> {
        let status = enum_to_str(&stage.status)?;
        let strategy = opt_enum_to_str(&stage.iteration_strategy)?;
        let parallel_type = enum_to_str(&stage.parallel_type)?;
        with_retry("create_stage_execution", || async {
            sqlx::query(
                r#"INSERT INTO stage_executions (
                    execution_id, session_id, stage_id, stage_index, stage_name,
                    agent, status, started_at_us, completed_at_us, paused_at_us,
                    duration_ms, current_iteration, iteration_strategy,
                    stage_output, error_message, parent_stage_execution_id,
                    parallel_index, parallel_type
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)"#,
            )
            .bind(&stage.execution_id)
            .bind(&stage.session_id)
            .bind(&stage.stage_id)
            .bind(stage.stage_index)
            .bind(&stage.stage_name)
            .bind(&stage.agent)
            .bind(&status)
            .bind(stage.started_at_us)
            .bind(stage.completed_at_us)
            .bind(stage.paused_at_us)
            .bind(stage.duration_ms)
            .bind(stage.current_iteration.map(|v| v as i32))
            .bind(&strategy)
            .bind(&stage.stage_output)
            .bind(&stage.error_message)
            .bind(&stage.parent_stage_execution_id)
            .bind(stage.parallel_index)
            .bind(&parallel_type)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_stage_execution", e))?;
            Ok(())
        })
        .await
    }

    async fn update_stage_execution(&self, stage: &StageExecution) -> Result<()> {
        let status = enum_to_str(&stage.status)?;
        let strategy = opt_enum_to_str(&stage.iteration_strategy)?;
        let updated = with_retry("update_stage_execution", || async {
            sqlx::query(
                r#"UPDATE stage_executions SET
                    status = $2, started_at_us = $3, completed_at_us = $4,
                    paused_at_us = $5, duration_ms = $6, current_iteration = $7,
                    iteration_strategy = $8, stage_output = $9, error_message = $10
                WHERE execution_id = $1"#,
            )
            .bind(&stage.execution_id)
            .bind(&status)
            .bind(stage.started_at_us)
            .bind(stage.completed_at_us)
            .bind(stage.paused_at_us)
            .bind(stage.duration_ms)
            .bind(stage.current_iteration.map(|v| v as i32))
            .bind(&strategy)
            .bind(&stage.stage_output)
            .bind(&stage.error_message)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_stage_execution", e))
        })
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("stage {}", stage.execution_id)));
        }
        Ok(())
    }

    async fn get_stage_execution(&self, execution_id: &str) -> Result<Option<StageExecution>> {
        let row = with_retry("get_stage_execution", || async {
            sqlx::query("SELECT * FROM stage_executions WHERE execution_id = $1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_stage_execution", e))
        })
        .await?;
        row.as_ref().map(stage_from_row).transpose()
    }

    async fn get_stage_executions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<StageExecution>> {
        let rows = with_retry("get_stage_executions_for_session", || async {
            sqlx::query(
                "SELECT * FROM stage_executions WHERE session_id = $1
                 ORDER BY stage_index, parallel_index",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_stage_executions_for_session", e))
        })
        .await?;
        rows.iter().map(stage_from_row).collect()
    }

    async fn create_llm_interaction(&self, interaction: &LlmInteraction) -> Result<()> {
        let conversation = serde_json::to_value(&interaction.conversation)?;
        let interaction_type = enum_to_str(&interaction.interaction_type)?;
        with_retry("create_llm_interaction", || async {
            sqlx::query(
                r#"INSERT INTO llm_interactions (
                    interaction_id, session_id, stage_execution_id, timestamp_us,
                    conversation, model_name, provider, interaction_type,
                    response_metadata, native_tools_config, thinking_content,
                    mcp_event_id, duration_ms, step_description
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
                ON CONFLICT (interaction_id) DO NOTHING"#,
            )
            .bind(&interaction.interaction_id)
            .bind(&interaction.session_id)
            .bind(&interaction.stage_execution_id)
            .bind(interaction.timestamp_us)
            .bind(&conversation)
            .bind(&interaction.model_name)
            .bind(&interaction.provider)
            .bind(&interaction_type)
            .bind(&interaction.response_metadata)
            .bind(&interaction.native_tools_config)
            .bind(&interaction.thinking_content)
            .bind(&interaction.mcp_event_id)
            .bind(interaction.duration_ms)
            .bind(&interaction.step_description)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_llm_interaction", e))?;
            Ok(())
        })
        .await
    }

    async fn create_mcp_interaction(&self, interaction: &McpInteraction) -> Result<()> {
        let communication_type = enum_to_str(&interaction.communication_type)?;
        with_retry("create_mcp_interaction", || async {
            sqlx::query(
                r#"INSERT INTO mcp_interactions (
                    request_id, session_id, stage_execution_id, timestamp_us,
                    server_name, communication_type, tool_name, tool_arguments,
                    tool_result, available_tools, duration_ms, success, error_message
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
                ON CONFLICT (request_id) DO NOTHING"#,
            )
            .bind(&interaction.request_id)
            .bind(&interaction.session_id)
            .bind(&interaction.stage_execution_id)
            .bind(interaction.timestamp_us)
            .bind(&interaction.server_name)
            .bind(&communication_type)
            .bind(&interaction.tool_name)
            .bind(&interaction.tool_arguments)
            .bind(&interaction.tool_result)
            .bind(&interaction.available_tools)
            .bind(interaction.duration_ms)
            .bind(interaction.success)
            .bind(&interaction.error_message)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_mcp_interaction", e))?;
            Ok(())
        })
        .await
    }

    async fn get_llm_interactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<LlmInteraction>> {
        let rows = with_retry("get_llm_interactions_for_session", || async {
            sqlx::query(
                "SELECT * FROM llm_interactions WHERE session_id = $1 ORDER BY timestamp_us",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_llm_interactions_for_session", e))
        })
        .await?;
        rows.iter()
            .map(|row| {
                let interaction_type: String = get(row, "interaction_type")?;
                Ok(LlmInteraction {
                    interaction_id: get(row, "interaction_id")?,
                    session_id: get(row, "session_id")?,
                    stage_execution_id: get(row, "stage_execution_id")?,
                    timestamp_us: get(row, "timestamp_us")?,
                    conversation: serde_json::from_value(get::<Value>(row, "conversation")?)?,
                    model_name: get(row, "model_name")?,
                    provider: get(row, "provider")?,
                    interaction_type: enum_from_str("interaction_type", &interaction_type)?,
                    response_metadata: get(row, "response_metadata")?,
                    native_tools_config: get(row, "native_tools_config")?,
                    thinking_content: get(row, "thinking_content")?,
                    mcp_event_id: get(row, "mcp_event_id")?,
                    duration_ms: get(row, "duration_ms")?,
                    step_description: get(row, "step_description")?,
                })
            })
            .collect()
    }

    async fn get_mcp_interactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<McpInteraction>> {
        let rows = with_retry("get_mcp_interactions_for_session", || async {
            sqlx::query(
                "SELECT * FROM mcp_interactions WHERE session_id = $1 ORDER BY timestamp_us",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_mcp_interactions_for_session", e))
        })
        .await?;
        rows.iter()
            .map(|row| {
                let communication_type: String = get(row, "communication_type")?;
                Ok(McpInteraction {
                    request_id: get(row, "request_id")?,
                    session_id: get(row, "session_id")?,
                    stage_execution_id: get(row, "stage_execution_id")?,
                    timestamp_us: get(row, "timestamp_us")?,
                    server_name: get(row, "server_name")?,
                    communication_type: enum_from_str("communication_type", &communication_type)?,
                    tool_name: get(row, "tool_name")?,
                    tool_arguments: get(row, "tool_arguments")?,
                    tool_result: get(row, "tool_result")?,
                    available_tools: get(row, "available_tools")?,
                    duration_ms: get(row, "duration_ms")?,
                    success: get(row, "success")?,
                    error_message: get(row, "error_message")?,
                })
            })
            .collect()
    }

    async fn create_event(&self, channel: &str, payload: Value) -> Result<Event> {
        let now = now_us();
        let row = with_retry("create_event", || async {
            sqlx::query(
                "INSERT INTO events (channel, payload, created_at_us)
                 VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(channel)
            .bind(&payload)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_event", e))
        })
        .await?;
        Ok(Event {
            id: get(&row, "id")?,
            channel: channel.to_string(),
            payload,
            created_at_us: now,
        })
    }

    async fn get_events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let rows = with_retry("get_events_after", || async {
            sqlx::query(
                "SELECT id, channel, payload, created_at_us FROM events
                 WHERE channel = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
            )
            .bind(channel)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_events_after", e))
        })
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Event {
                    id: get(row, "id")?,
                    channel: get(row, "channel")?,
                    payload: get(row, "payload")?,
                    created_at_us: get(row, "created_at_us")?,
                })
            })
            .collect()
    }

    async fn latest_event_id(&self, channel: &str) -> Result<i64> {
        with_retry("latest_event_id", || async {
            sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM events WHERE channel = $1")
                .bind(channel)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("latest_event_id", e))
        })
        .await
    }

    async fn delete_events_before(&self, cutoff_us: i64) -> Result<u64> {
        let result = with_retry("delete_events_before", || async {
            sqlx::query("DELETE FROM events WHERE created_at_us < $1")
                .bind(cutoff_us)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_events_before", e))
        })
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_domain::chain::IterationStrategy;
    use tarsy_domain::interaction::InteractionType;
    use tarsy_domain::status::{ParallelType, StageStatus};

    #[test]
    fn enum_str_conversion_roundtrips() {
        assert_eq!(enum_to_str(&StageStatus::TimedOut).unwrap(), "timed_out");
        assert_eq!(
            enum_to_str(&IterationStrategy::SynthesisNativeThinking).unwrap(),
            "synthesis-native-thinking"
        );
        assert_eq!(enum_to_str(&ParallelType::MultiAgent).unwrap(), "multi_agent");
        let back: InteractionType = enum_from_str("t", "final_answer").unwrap();
        assert_eq!(back, InteractionType::FinalAnswer);
    }

    #[test]
    fn unknown_enum_value_is_error() {
        let res: Result<StageStatus> = enum_from_str("stage.status", "exploded");
        assert!(res.is_err());
    }
}
