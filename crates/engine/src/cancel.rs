//! Cancellation tracker: the only authority on user-initiated cancels.
//!
//! A session that unwinds with a cancellation is CANCELLED when its id is
//! marked here and TIMED_OUT otherwise. Nothing else ever decides between
//! the two. The tracker also keeps the per-run [`CancelToken`]s so a
//! cancel request (local or relayed from another replica) can flip the
//! flag the controllers poll.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use tarsy_domain::cancel::CancelToken;

#[derive(Default)]
pub struct CancellationTracker {
    /// Session ids that received a user-initiated cancel.
    user_cancelled: Mutex<HashSet<String>>,
    /// Live run tokens, one per session currently executing here.
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user-initiated cancel. Called from the cancel endpoint and
    /// from the cross-replica cancellations listener only.
    pub fn mark_user_cancelled(&self, session_id: &str) {
        self.user_cancelled.lock().insert(session_id.to_string());
        tracing::debug!(session_id, "marked session as user-cancelled");
    }

    /// CANCELLED (true) vs TIMED_OUT (false) for an unwound run.
    pub fn is_user_cancel(&self, session_id: &str) -> bool {
        self.user_cancelled.lock().contains(session_id)
    }

    pub fn clear(&self, session_id: &str) {
        self.user_cancelled.lock().remove(session_id);
    }

    /// Register a fresh token for a run starting on this replica.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_string(), token.clone());
        token
    }

    /// Flip the in-process flag for a run this replica owns. Returns
    /// whether a live run was found.
    pub fn cancel_local(&self, session_id: &str) -> bool {
        match self.tokens.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token when a run leaves this replica (any outcome).
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }
}
