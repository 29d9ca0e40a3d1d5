//! Failure classification for the retry-with-reinit policy.
//!
//! The table, per operation attempt:
//! - session lost (HTTP 404, closed stream, generic transport error) →
//!   tear down, re-initialize, retry once
//! - upstream error (500/502/503/504) → same as session lost
//! - rate limited (429) → short randomized sleep, retry on the same session
//! - auth (401/403), JSON-RPC semantic errors, anything else → no retry

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Tear the session down and retry on a fresh one.
    SessionLost,
    /// Upstream/gateway failure: treated like a lost session.
    Upstream,
    /// Retry on the same session after a randomized backoff.
    RateLimited,
    /// Credential problem; retrying cannot help.
    Auth,
    /// The server understood us and said no (invalid params etc.).
    Semantic,
    /// Unknown; no retry.
    Other,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureClass::SessionLost | FailureClass::Upstream | FailureClass::RateLimited
        )
    }

    /// Whether recovery must rebuild the session before retrying.
    pub fn needs_reinit(self) -> bool {
        matches!(self, FailureClass::SessionLost | FailureClass::Upstream)
    }
}

pub fn classify(error: &TransportError) -> FailureClass {
    match error {
        TransportError::Http { status: 404, .. } => FailureClass::SessionLost,
        TransportError::Http {
            status: 500 | 502 | 503 | 504,
            ..
        } => FailureClass::Upstream,
        TransportError::Http { status: 429, .. } => FailureClass::RateLimited,
        TransportError::Http {
            status: 401 | 403, ..
        } => FailureClass::Auth,
        TransportError::Http { .. } => FailureClass::Other,
        TransportError::Io(_)
        | TransportError::ProcessExited
        | TransportError::StreamClosed
        | TransportError::Timeout => FailureClass::SessionLost,
        TransportError::Rpc(_) => FailureClass::Semantic,
        TransportError::Json(_) => FailureClass::Semantic,
        TransportError::Other(_) => FailureClass::Other,
    }
}
