//! In-memory store with the same contract as the Postgres store.
//!
//! A single mutex guards all state, which makes the claim and
//! cancel-transition paths trivially atomic. Events get ids from a
//! monotonically increasing counter, matching the serial column of the
//! relational store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use tarsy_domain::error::Error;
use tarsy_domain::event::Event;
use tarsy_domain::interaction::{LlmInteraction, McpInteraction};
use tarsy_domain::session::AlertSession;
use tarsy_domain::stage::StageExecution;
use tarsy_domain::status::SessionStatus;
use tarsy_domain::timestamp::now_us;
use tarsy_domain::Result;

use crate::{check_session_invariants, SessionFilter, Store};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, AlertSession>,
    /// alert_id → session_id, backing the unique constraint.
    alert_index: HashMap<String, String>,
    stages: HashMap<String, StageExecution>,
    llm_interactions: Vec<LlmInteraction>,
    mcp_interactions: Vec<McpInteraction>,
    events: Vec<Event>,
    next_event_id: i64,
}

/// Mutex-guarded in-process store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_event_id: 1,
                ..Inner::default()
            }),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: &AlertSession) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.alert_index.contains_key(&session.alert_id) {
            return Err(Error::DuplicateAlert(session.alert_id.clone()));
        }
        inner
            .alert_index
            .insert(session.alert_id.clone(), session.session_id.clone());
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<AlertSession>> {
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    async fn update_session(&self, session: &AlertSession) -> Result<()> {
        check_session_invariants(session)?;
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&session.session_id) {
            return Err(Error::NotFound(format!("session {}", session.session_id)));
        }
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn claim_next_pending_session(&self, pod_id: &str) -> Result<Option<AlertSession>> {
        let mut inner = self.inner.lock();
        let oldest = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending)
            .min_by_key(|s| (s.started_at_us, s.session_id.clone()))
            .map(|s| s.session_id.clone());

        let Some(session_id) = oldest else {
            return Ok(None);
        };
        // Still under the same lock, so the entry cannot have vanished.
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        session.status = SessionStatus::InProgress;
        session.pod_id = Some(pod_id.to_string());
        session.last_interaction_at_us = Some(now_us());
        Ok(Some(session.clone()))
    }

    async fn touch_session(&self, session_id: &str, at_us: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        session.last_interaction_at_us = Some(at_us);
        Ok(())
    }

    async fn count_pending_sessions(&self) -> Result<u64> {
        self.count_sessions_by_status(SessionStatus::Pending).await
    }

    async fn count_sessions_by_status(&self, status: SessionStatus) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.status == status)
            .count() as u64)
    }

    async fn update_session_to_canceling(
        &self,
        session_id: &str,
    ) -> Result<(bool, SessionStatus)> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if session.status.is_active() {
            session.status = SessionStatus::Canceling;
            Ok((true, SessionStatus::Canceling))
        } else {
            Ok((false, session.status))
        }
    }

    async fn get_active_sessions(&self) -> Result<Vec<AlertSession>> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.status.is_active())
            .cloned()
            .collect())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<(Vec<AlertSession>, u64)> {
        let inner = self.inner.lock();
        let mut matching: Vec<&AlertSession> = inner
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .collect();
        matching.sort_by_key(|s| std::cmp::Reverse(s.started_at_us));
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn delete_sessions_older_than(&self, cutoff_us: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.started_at_us < cutoff_us)
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &doomed {
            if let Some(session) = inner.sessions.remove(session_id) {
                inner.alert_index.remove(&session.alert_id);
            }
            // Cascade: stages and interactions go with the session.
            inner.stages.retain(|_, st| &st.session_id != session_id);
            inner
                .llm_interactions
                .retain(|i| &i.session_id != session_id);
            inner
                .mcp_interactions
                .retain(|i| &i.session_id != session_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn create_stage_execution(&self, stage: &StageExecution) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&stage.session_id) {
            return Err(Error::NotFound(format!("session {}", stage.session_id)));
        }
        // Mirrors the relational unique tuple that makes retried inserts safe.
        let duplicate = inner.stages.values().any(|st| {
            st.session_id == stage.session_id
                && st.stage_index == stage.stage_index
                && st.parallel_index == stage.parallel_index
                && st.execution_id != stage.execution_id
        });
        if duplicate {
            return Err(Error::Validation(format!(
                "stage ({}, {}, {}) already exists",
                stage.session_id, stage.stage_index, stage.parallel_index
            )));
        }
        inner
            .stages
            .insert(stage.execution_id.clone(), stage.clone());
        Ok(())
    }

    async fn update_stage_execution(&self, stage: &StageExecution) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.stages.contains_key(&stage.execution_id) {
            return Err(Error::NotFound(format!("stage {}", stage.execution_id)));
        }
        inner
            .stages
            .insert(stage.execution_id.clone(), stage.clone());
        Ok(())
    }

    async fn get_stage_execution(&self, execution_id: &str) -> Result<Option<StageExecution>> {
        Ok(self.inner.lock().stages.get(execution_id).cloned())
    }

    async fn get_stage_executions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<StageExecution>> {
        let inner = self.inner.lock();
        let mut stages: Vec<StageExecution> = inner
            .stages
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| (s.stage_index, s.parallel_index));
        Ok(stages)
    }

    async fn create_llm_interaction(&self, interaction: &LlmInteraction) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .llm_interactions
            .iter()
            .any(|i| i.interaction_id == interaction.interaction_id)
        {
            return Ok(());
        }
        inner.llm_interactions.push(interaction.clone());
        Ok(())
    }

    async fn create_mcp_interaction(&self, interaction: &McpInteraction) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .mcp_interactions
            .iter()
            .any(|i| i.request_id == interaction.request_id)
        {
            return Ok(());
        }
        inner.mcp_interactions.push(interaction.clone());
        Ok(())
    }

    async fn get_llm_interactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<LlmInteraction>> {
        Ok(self
            .inner
            .lock()
            .llm_interactions
            .iter()
            .filter(|i| i.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn get_mcp_interactions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<McpInteraction>> {
        Ok(self
            .inner
            .lock()
            .mcp_interactions
            .iter()
            .filter(|i| i.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create_event(&self, channel: &str, payload: Value) -> Result<Event> {
        let mut inner = self.inner.lock();
        let event = Event {
            id: inner.next_event_id,
            channel: channel.to_string(),
            payload,
            created_at_us: now_us(),
        };
        inner.next_event_id += 1;
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn get_events_after(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>> {
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|e| e.channel == channel && e.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_event_id(&self, channel: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.id)
            .max()
            .unwrap_or(0))
    }

    async fn delete_events_before(&self, cutoff_us: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.events.len();
        inner.events.retain(|e| e.created_at_us >= cutoff_us);
        Ok((before - inner.events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use tarsy_domain::alert::Alert;

    fn session(alert_id: &str) -> AlertSession {
        let alert = Alert {
            alert_type: "kubernetes".into(),
            runbook: None,
            severity: None,
            timestamp: None,
            data: serde_json::json!({}),
            mcp: None,
        };
        AlertSession::pending(&alert, alert_id, "chain", serde_json::json!({}), "tester")
    }

    #[tokio::test]
    async fn duplicate_alert_id_rejected() {
        let store = MemoryStore::new();
        store.create_session(&session("a1")).await.unwrap();
        let err = store.create_session(&session("a1")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateAlert(_)));
    }

    #[tokio::test]
    async fn claim_is_oldest_first_and_exhaustive() {
        let store = MemoryStore::new();
        let mut first = session("a1");
        first.started_at_us -= 1_000_000;
        store.create_session(&first).await.unwrap();
        store.create_session(&session("a2")).await.unwrap();

        let claimed = store.claim_next_pending_session("pod-1").await.unwrap().unwrap();
        assert_eq!(claimed.session_id, first.session_id);
        assert_eq!(claimed.status, SessionStatus::InProgress);
        assert_eq!(claimed.pod_id.as_deref(), Some("pod-1"));
        assert!(claimed.last_interaction_at_us.is_some());

        assert!(store.claim_next_pending_session("pod-2").await.unwrap().is_some());
        assert!(store.claim_next_pending_session("pod-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..20 {
            store.create_session(&session(&format!("a{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let pod = format!("pod-{worker}");
                let mut claimed = Vec::new();
                while let Some(s) = store.claim_next_pending_session(&pod).await.unwrap() {
                    claimed.push(s.session_id);
                }
                claimed
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        // Every pending session claimed exactly once.
        assert_eq!(all.len(), 20);
        assert_eq!(all.iter().collect::<HashSet<_>>().len(), 20);
        assert_eq!(store.count_pending_sessions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn canceling_transition_gates_on_active() {
        let store = MemoryStore::new();
        let mut s = session("a1");
        store.create_session(&s).await.unwrap();

        let (changed, status) = store.update_session_to_canceling(&s.session_id).await.unwrap();
        assert!(changed);
        assert_eq!(status, SessionStatus::Canceling);

        // Terminal sessions are left alone.
        s.status = SessionStatus::Canceling;
        s.finish(SessionStatus::Cancelled);
        store.update_session(&s).await.unwrap();
        let (changed, status) = store.update_session_to_canceling(&s.session_id).await.unwrap();
        assert!(!changed);
        assert_eq!(status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminal_update_requires_completed_stamp() {
        let store = MemoryStore::new();
        let mut s = session("a1");
        store.create_session(&s).await.unwrap();
        s.status = SessionStatus::Failed;
        // completed_at_us deliberately left unset.
        assert!(matches!(
            store.update_session(&s).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn retention_cascades_to_children() {
        let store = MemoryStore::new();
        let s = session("a1");
        store.create_session(&s).await.unwrap();
        let stage = StageExecution::started(
            &s.session_id,
            "analysis",
            0,
            "Analysis",
            "KubernetesAgent",
            tarsy_domain::chain::IterationStrategy::React,
        );
        store.create_stage_execution(&stage).await.unwrap();
        let mut interaction = LlmInteraction::new(&s.session_id, Default::default());
        interaction.stage_execution_id = Some(stage.execution_id.clone());
        store.create_llm_interaction(&interaction).await.unwrap();

        let deleted = store.delete_sessions_older_than(now_us() + 1).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_session(&s.session_id).await.unwrap().is_none());
        assert!(store
            .get_stage_executions_for_session(&s.session_id)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_llm_interactions_for_session(&s.session_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_stage_tuple_rejected() {
        let store = MemoryStore::new();
        let s = session("a1");
        store.create_session(&s).await.unwrap();
        let stage = StageExecution::started(
            &s.session_id,
            "analysis",
            0,
            "Analysis",
            "KubernetesAgent",
            tarsy_domain::chain::IterationStrategy::React,
        );
        store.create_stage_execution(&stage).await.unwrap();
        // Same (session, stage_index, parallel_index) under a new id.
        let mut dup = stage.clone();
        dup.execution_id = tarsy_domain::timestamp::new_id();
        assert!(store.create_stage_execution(&dup).await.is_err());
        // Re-inserting the same row (same id) is tolerated upstream by the
        // idempotent interaction paths, but stages are create-once.
    }

    #[tokio::test]
    async fn interaction_inserts_are_idempotent() {
        let store = MemoryStore::new();
        let s = session("a1");
        store.create_session(&s).await.unwrap();
        let interaction = LlmInteraction::new(&s.session_id, Default::default());
        store.create_llm_interaction(&interaction).await.unwrap();
        store.create_llm_interaction(&interaction).await.unwrap();
        assert_eq!(
            store
                .get_llm_interactions_for_session(&s.session_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn events_are_ordered_and_tailable() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create_event("sessions", serde_json::json!({"n": i}))
                .await
                .unwrap();
        }
        store
            .create_event("other", serde_json::json!({"n": 99}))
            .await
            .unwrap();

        let tail = store.get_events_after("sessions", 2, 100).await.unwrap();
        let ids: Vec<i64> = tail.iter().map(|e| e.id).collect();
        assert_eq!(ids, [3, 4, 5]);

        let capped = store.get_events_after("sessions", 0, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn event_cleanup_is_idempotent() {
        let store = MemoryStore::new();
        store.create_event("c", serde_json::json!({})).await.unwrap();
        store.create_event("c", serde_json::json!({})).await.unwrap();
        let cutoff = now_us() + 1;
        assert_eq!(store.delete_events_before(cutoff).await.unwrap(), 2);
        assert_eq!(store.delete_events_before(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_sessions_filters_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..10 {
            let mut s = session(&format!("a{i}"));
            s.started_at_us = 1_000 + i;
            if i % 2 == 0 {
                s.status = SessionStatus::InProgress;
            }
            store.create_session(&s).await.unwrap();
        }

        let filter = SessionFilter {
            status: Some(SessionStatus::InProgress),
            limit: 3,
            ..Default::default()
        };
        let (page, total) = store.list_sessions(&filter).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 3);
        // Newest first.
        assert!(page[0].started_at_us > page[1].started_at_us);
    }
}
