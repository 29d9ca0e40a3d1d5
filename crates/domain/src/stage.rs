//! Stage execution record — one stage (or one parallel child) within a
//! chain run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::IterationStrategy;
use crate::status::{ParallelType, StageStatus};
use crate::timestamp::{new_id, now_us};

/// One stage execution row.
///
/// At most one of `stage_output` / `error_message` is ever set.
/// For parallel fan-out, the root row has `parallel_index` 0 and children
/// 1..N, all sharing the root's `execution_id` as `parent_stage_execution_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub execution_id: String,
    pub session_id: String,
    /// Logical stage identifier from the chain definition, e.g. `"initial-analysis"`.
    pub stage_id: String,
    /// 0-based position in the chain.
    pub stage_index: i32,
    pub stage_name: String,
    /// Agent class identifier executing this stage.
    pub agent: String,
    pub status: StageStatus,
    #[serde(default)]
    pub started_at_us: Option<i64>,
    #[serde(default)]
    pub completed_at_us: Option<i64>,
    #[serde(default)]
    pub paused_at_us: Option<i64>,
    /// Wall time excluding paused/waiting intervals.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub current_iteration: Option<u32>,
    #[serde(default)]
    pub iteration_strategy: Option<IterationStrategy>,
    #[serde(default)]
    pub stage_output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub parent_stage_execution_id: Option<String>,
    #[serde(default)]
    pub parallel_index: i32,
    #[serde(default)]
    pub parallel_type: ParallelType,
}

impl StageExecution {
    /// A freshly started (ACTIVE) stage row.
    pub fn started(
        session_id: impl Into<String>,
        stage_id: impl Into<String>,
        stage_index: i32,
        stage_name: impl Into<String>,
        agent: impl Into<String>,
        strategy: IterationStrategy,
    ) -> Self {
        Self {
            execution_id: new_id(),
            session_id: session_id.into(),
            stage_id: stage_id.into(),
            stage_index,
            stage_name: stage_name.into(),
            agent: agent.into(),
            status: StageStatus::Active,
            started_at_us: Some(now_us()),
            completed_at_us: None,
            paused_at_us: None,
            duration_ms: None,
            current_iteration: None,
            iteration_strategy: Some(strategy),
            stage_output: None,
            error_message: None,
            parent_stage_execution_id: None,
            parallel_index: 0,
            parallel_type: ParallelType::Single,
        }
    }

    /// Derive a parallel child row from this (parent) row.
    pub fn parallel_child(
        &self,
        parallel_index: i32,
        agent: impl Into<String>,
        parallel_type: ParallelType,
    ) -> Self {
        Self {
            execution_id: new_id(),
            agent: agent.into(),
            parent_stage_execution_id: Some(self.execution_id.clone()),
            parallel_index,
            parallel_type,
            started_at_us: Some(now_us()),
            ..self.clone()
        }
    }

    /// Close the stage with a success output.
    pub fn complete(&mut self, output: Value) {
        self.status = StageStatus::Completed;
        self.stage_output = Some(output);
        self.error_message = None;
        self.stamp_completed();
    }

    /// Close the stage with an error status.
    pub fn fail(&mut self, status: StageStatus, error: impl Into<String>) {
        debug_assert!(status.is_error() || status == StageStatus::Partial);
        self.status = status;
        self.error_message = Some(error.into());
        self.stamp_completed();
    }

    fn stamp_completed(&mut self) {
        let now = now_us();
        self.completed_at_us = Some(now);
        if let Some(start) = self.started_at_us {
            let paused_us = self
                .paused_at_us
                .map(|p| now.saturating_sub(p))
                .unwrap_or(0);
            self.duration_ms = Some((now - start - paused_us).max(0) / 1_000);
        }
    }
}
