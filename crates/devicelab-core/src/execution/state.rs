//! Progress of a session through its execution plan.

use super::hasher::hash_session_execution_step;
use super::steps::{ExecutionPlan, ExecutionStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution step together with its identifier and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStepState {
    pub step: ExecutionStep,
    /// Stable identifier, see [`hash_session_execution_step`].
    pub hash: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionStepState {
    fn new(session_id: Uuid, step: ExecutionStep) -> Self {
        Self {
            hash: hash_session_execution_step(session_id, &step),
            step,
            status: StepStatus::NotStarted,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn set_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn set_completed(&mut self) {
        self.status = StepStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn set_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }
}

/// A session's plan and the state of each of its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub end_on_failure: bool,
    pub steps: Vec<ExecutionStepState>,
}

impl SessionState {
    pub fn new(session_id: Uuid, plan: ExecutionPlan) -> Self {
        let end_on_failure = plan.test_plan.end_on_failure;
        let steps = plan
            .execution_steps
            .into_iter()
            .map(|step| ExecutionStepState::new(session_id, step))
            .collect();
        Self {
            session_id,
            end_on_failure,
            steps,
        }
    }

    /// Index of the next step to run.
    ///
    /// `None` when every step has run, or when a step failed and the session
    /// ends on failure.
    pub fn next_execution_step(&self) -> Option<usize> {
        if self.end_on_failure && self.has_failures() {
            return None;
        }
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::NotStarted)
    }

    pub fn step(&self, index: usize) -> Option<&ExecutionStepState> {
        self.steps.get(index)
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut ExecutionStepState> {
        self.steps.get_mut(index)
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn is_finished(&self) -> bool {
        self.next_execution_step().is_none()
            && !self.steps.iter().any(|s| s.status == StepStatus::Running)
    }

    /// Number of steps in each status: `(completed, failed, not_started)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.steps.iter().fold((0, 0, 0), |(c, f, n), s| match s.status {
            StepStatus::Completed => (c + 1, f, n),
            StepStatus::Failed => (c, f + 1, n),
            StepStatus::NotStarted => (c, f, n + 1),
            StepStatus::Running => (c, f, n),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::plan::{
        Metric, PlanStep, RecordingStartStrategy, RecordingStrategy, RepetitionStrategy,
        SessionTestPlan, StepTestCase, XctestrunConfig,
    };

    fn session(end_on_failure: bool) -> SessionState {
        let test_plan = SessionTestPlan {
            name: Some("state".into()),
            xctestrun_config: XctestrunConfig {
                path: "App.xctestrun".into(),
                test_configuration: "Default".into(),
            },
            end_on_failure,
            repetitions: 1,
            repetition_strategy: RepetitionStrategy::EntireSuite,
            metrics: vec![Metric::Cpu],
            recording_strategy: RecordingStrategy::PerStep,
            recording_start_strategy: RecordingStartStrategy::Launch,
            reinstall_app: false,
            steps: (0..3)
                .map(|order| PlanStep::new(order, vec![StepTestCase::new("T/C/m")]))
                .collect(),
        };
        SessionState::new(Uuid::new_v4(), ExecutionPlan::from_test_plan(test_plan).unwrap())
    }

    #[test]
    fn test_steps_run_in_order() {
        let mut state = session(false);
        assert_eq!(state.next_execution_step(), Some(0));

        state.step_mut(0).unwrap().set_running();
        assert_eq!(state.next_execution_step(), Some(1));
        assert!(!state.is_finished());

        state.step_mut(0).unwrap().set_completed();
        let first = state.step(0).unwrap();
        assert_eq!(first.status, StepStatus::Completed);
        assert!(first.started_at.is_some() && first.finished_at.is_some());
    }

    #[test]
    fn test_failure_continues_without_end_on_failure() {
        let mut state = session(false);
        state.step_mut(0).unwrap().set_failed("boom");
        assert_eq!(state.next_execution_step(), Some(1));
        assert_eq!(state.step(0).unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_end_on_failure_stops_session() {
        let mut state = session(true);
        state.step_mut(0).unwrap().set_completed();
        state.step_mut(1).unwrap().set_failed("boom");

        assert_eq!(state.next_execution_step(), None);
        assert!(state.is_finished());
        assert_eq!(state.counts(), (1, 1, 1));
    }

    #[test]
    fn test_hashes_are_unique_per_step() {
        let state = session(false);
        let mut hashes: Vec<&str> = state.steps.iter().map(|s| s.hash.as_str()).collect();
        hashes.sort_unstable();
        hashes.dedup();
        assert_eq!(hashes.len(), 3);
    }
}
