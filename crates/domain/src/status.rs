//! Session and stage status enums with their lifecycle classification.
//!
//! Statuses are persisted as lowercase snake_case strings. The session
//! statuses partition into an *active* set (work may still happen) and a
//! *terminal* set (the session is done); the two sets are disjoint and
//! together cover every value. `canceling` is active — it is the transition
//! window between a cancel request and the worker acknowledging it.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Paused,
    Canceling,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 8] = [
        SessionStatus::Pending,
        SessionStatus::InProgress,
        SessionStatus::Paused,
        SessionStatus::Canceling,
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Cancelled,
        SessionStatus::TimedOut,
    ];

    pub const ACTIVE: [SessionStatus; 4] = [
        SessionStatus::Pending,
        SessionStatus::InProgress,
        SessionStatus::Paused,
        SessionStatus::Canceling,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// The persisted string form (`"in_progress"`, `"timed_out"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Canceling => "canceling",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// Parallel parent where some children completed and some failed.
    Partial,
}

impl StageStatus {
    /// Error statuses: the stage ended without producing an output.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            StageStatus::Failed | StageStatus::Cancelled | StageStatus::TimedOut
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_error() || matches!(self, StageStatus::Completed | StageStatus::Partial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Active => "active",
            StageStatus::Paused => "paused",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
            StageStatus::TimedOut => "timed_out",
            StageStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage execution row relates to parallel fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelType {
    /// Ordinary single-agent stage.
    #[default]
    Single,
    /// Parent or child of a multi-agent fan-out.
    MultiAgent,
    /// Parent or child of a same-agent replica fan-out.
    Replica,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_terminal_partition_all_statuses() {
        for status in SessionStatus::ALL {
            // Exactly one of the two classifications holds.
            assert_ne!(
                status.is_active(),
                status.is_terminal(),
                "{status} must be in exactly one set"
            );
        }
    }

    #[test]
    fn canceling_is_active_cancelled_is_terminal() {
        assert!(SessionStatus::Canceling.is_active());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn session_status_serde_roundtrip() {
        for status in SessionStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let back: SessionStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn session_status_parse() {
        assert_eq!(
            SessionStatus::parse("in_progress"),
            Some(SessionStatus::InProgress)
        );
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn stage_error_subset() {
        assert!(StageStatus::Failed.is_error());
        assert!(StageStatus::Cancelled.is_error());
        assert!(StageStatus::TimedOut.is_error());
        assert!(!StageStatus::Completed.is_error());
        assert!(!StageStatus::Partial.is_error());
        assert!(!StageStatus::Paused.is_error());
    }

    #[test]
    fn stage_terminal_subset() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Partial.is_terminal());
        assert!(!StageStatus::Active.is_terminal());
        assert!(!StageStatus::Paused.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
    }
}
