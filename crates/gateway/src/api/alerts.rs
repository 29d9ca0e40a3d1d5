//! `POST /api/v1/alerts` — alert ingress.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};

use tarsy_domain::alert::Alert;

use crate::api::error_response;
use crate::state::AppState;

/// Author comes from the auth proxy's forwarded identity headers, user
/// name preferred over email, `"api-client"` when neither is present.
fn author_from_headers(headers: &HeaderMap) -> Option<String> {
    for header in ["x-forwarded-user", "x-forwarded-email"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub async fn submit_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(alert): Json<Alert>,
) -> Response {
    let author = author_from_headers(&headers);
    match state.alerts.submit(alert, author).await {
        Ok(session) => Json(serde_json::json!({
            "session_id": session.session_id,
            "status": "queued",
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_user_beats_email() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", "alice".parse().unwrap());
        headers.insert("x-forwarded-email", "alice@example.com".parse().unwrap());
        assert_eq!(author_from_headers(&headers).as_deref(), Some("alice"));
    }

    #[test]
    fn email_fallback_and_default() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-email", "bob@example.com".parse().unwrap());
        assert_eq!(
            author_from_headers(&headers).as_deref(),
            Some("bob@example.com")
        );
        assert!(author_from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn blank_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", "  ".parse().unwrap());
        assert!(author_from_headers(&headers).is_none());
    }
}
