//! History API: session listing, detail, stage cancel, resume.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use tarsy_domain::error::Error;
use tarsy_domain::session::AlertSession;
use tarsy_domain::status::SessionStatus;
use tarsy_store::SessionFilter;

use crate::api::error_response;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Listing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    alert_type: Option<String>,
    #[serde(default)]
    started_after_us: Option<i64>,
    #[serde(default)]
    started_before_us: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

/// Listing rows omit the heavyweight JSON columns.
fn session_summary(session: &AlertSession) -> serde_json::Value {
    serde_json::json!({
        "session_id": session.session_id,
        "alert_id": session.alert_id,
        "alert_type": session.alert_type,
        "agent_type": session.agent_type,
        "chain_id": session.chain_id,
        "author": session.author,
        "status": session.status,
        "pod_id": session.pod_id,
        "started_at_us": session.started_at_us,
        "completed_at_us": session.completed_at_us,
        "current_stage_id": session.current_stage_id,
        "error_message": session.error_message,
    })
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match &query.status {
        Some(raw) => match SessionStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return error_response(Error::Validation(format!("unknown status '{raw}'")));
            }
        },
        None => None,
    };
    let filter = SessionFilter {
        status,
        agent_type: query.agent_type,
        alert_type: query.alert_type,
        started_after_us: query.started_after_us,
        started_before_us: query.started_before_us,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    };

    match state.store.list_sessions(&filter).await {
        Ok((sessions, total)) => Json(serde_json::json!({
            "sessions": sessions.iter().map(session_summary).collect::<Vec<_>>(),
            "total": total,
            "limit": filter.effective_limit(),
            "offset": filter.offset,
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Detail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let session = match state.store.get_session(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(Error::NotFound(format!("session {session_id}"))),
        Err(error) => return error_response(error),
    };

    let stages = state
        .store
        .get_stage_executions_for_session(&session_id)
        .await;
    let llm_interactions = state
        .store
        .get_llm_interactions_for_session(&session_id)
        .await;
    let mcp_interactions = state
        .store
        .get_mcp_interactions_for_session(&session_id)
        .await;
    match (stages, llm_interactions, mcp_interactions) {
        (Ok(stages), Ok(llm_interactions), Ok(mcp_interactions)) => {
            Json(serde_json::json!({
                "session": session,
                "stages": stages,
                "llm_interactions": llm_interactions,
                "mcp_interactions": mcp_interactions,
            }))
            .into_response()
        }
        (Err(error), ..) | (_, Err(error), _) | (.., Err(error)) => error_response(error),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancel / resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel_stage(
    State(state): State<AppState>,
    Path((session_id, execution_id)): Path<(String, String)>,
) -> Response {
    // The cancel is session-scoped; the execution id in the path names
    // which stage the user was looking at and must at least exist.
    match state.store.get_stage_execution(&execution_id).await {
        Ok(Some(stage)) if stage.session_id == session_id => {}
        Ok(_) => {
            return error_response(Error::NotFound(format!(
                "stage {execution_id} in session {session_id}"
            )))
        }
        Err(error) => return error_response(error),
    }

    match state.sessions.request_cancel(&session_id).await {
        Ok(status) => Json(serde_json::json!({
            "session_id": session_id,
            "status": status,
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}

pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.sessions.resume(&session_id).await {
        Ok(()) => Json(serde_json::json!({
            "session_id": session_id,
            "status": "resuming",
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}
