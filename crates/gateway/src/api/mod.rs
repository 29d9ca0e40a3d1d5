//! HTTP API: routing and the error-to-status mapping.

pub mod alerts;
pub mod history;
pub mod system;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tarsy_domain::error::Error;

use crate::state::AppState;
use crate::ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/alerts", post(alerts::submit_alert))
        .route("/api/v1/history/sessions", get(history::list_sessions))
        .route("/api/v1/history/sessions/:id", get(history::session_detail))
        .route(
            "/api/v1/history/sessions/:id/stages/:execution_id/cancel",
            post(history::cancel_stage),
        )
        .route(
            "/api/v1/history/sessions/:id/resume",
            post(history::resume_session),
        )
        .route("/api/v1/system/warnings", get(system::warnings))
        .route("/api/v1/system/mcp-servers", get(system::mcp_servers))
        .route("/api/v1/ws", get(ws::ws_handler))
        .route("/health", get(system::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map engine errors onto wire status codes and the `{"error": ...}` body
/// shape (QueueFull carries its sizes).
pub fn error_response(error: Error) -> Response {
    match &error {
        Error::Validation(message) => {
            (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": message}))).into_response()
        }
        Error::NotFound(message) => {
            (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": message}))).into_response()
        }
        Error::DuplicateAlert(message) => {
            (StatusCode::CONFLICT, Json(serde_json::json!({"error": message}))).into_response()
        }
        Error::QueueFull {
            queue_size,
            max_queue_size,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Queue full",
                "queue_size": queue_size,
                "max_queue_size": max_queue_size,
            })),
        )
            .into_response(),
        Error::StoreUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "storage unavailable"})),
        )
            .into_response(),
        _ => {
            tracing::error!(error = %error, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": error.to_string()})),
            )
                .into_response()
        }
    }
}
