//! System API: liveness, startup warnings, MCP server registry snapshot.

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn warnings(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({"warnings": state.warnings.list()}))
}

/// Cached registry snapshot; until the monitor's first sweep lands
/// (roughly the first ~15s after startup) a live probe answers instead.
pub async fn mcp_servers(State(state): State<AppState>) -> impl IntoResponse {
    let (servers, cached) = match state.mcp_health.snapshot() {
        Some(snapshot) => (snapshot, true),
        None => (state.mcp_health.probe().await, false),
    };
    Json(serde_json::json!({
        "servers": servers,
        "cached": cached,
    }))
}
