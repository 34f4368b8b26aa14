//! Expansion of a test plan into the ordered steps that are executed.

use super::plan::{
    Metric, PlanStep, RecordingStartStrategy, RecordingStrategy, RepetitionStrategy,
    SessionTestPlan, StepTestCase,
};
use crate::error::PlanError;
use serde::{Deserialize, Serialize};

/// One unit of execution derived from a [`PlanStep`].
///
/// Plan-level settings are already resolved against the step's overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Repetition of the whole plan; always 0 with the per-step strategy.
    pub plan_repetition: u32,
    pub step: PlanStep,
    pub step_repetition: u32,
    pub recording_start_strategy: RecordingStartStrategy,
    pub reinstall_app: bool,
    pub metrics: Vec<Metric>,
    pub test_cases: Vec<StepTestCase>,
    pub end_on_failure: bool,
}

impl ExecutionStep {
    /// Position of the originating step in the plan.
    pub fn order(&self) -> u32 {
        self.step.order
    }

    /// Test identifiers to pass to `-only-testing`.
    pub fn only_testing(&self) -> Vec<String> {
        self.test_cases.iter().map(|t| t.xctest_id.clone()).collect()
    }
}

/// Upper bound on the steps a single plan may expand to.
pub const MAX_EXECUTION_STEPS: u64 = 100_000;

/// The full, ordered list of steps for a validated plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub test_plan: SessionTestPlan,
    pub execution_steps: Vec<ExecutionStep>,
}

impl ExecutionPlan {
    /// Validate `test_plan` and expand it.
    ///
    /// - `entire_suite`: for each plan repetition, each step, each step
    ///   repetition.
    /// - `per_step`: for each step, `step.repetitions * plan.repetitions`
    ///   consecutive runs, all with plan repetition 0.
    ///
    /// With per-test recording each run is further split into one step per
    /// test case, and only the first of them reinstalls the app.
    pub fn from_test_plan(test_plan: SessionTestPlan) -> Result<Self, PlanError> {
        let test_plan = test_plan.validated()?;
        let planned = planned_step_count(&test_plan)
            .filter(|count| *count <= MAX_EXECUTION_STEPS)
            .ok_or(PlanError::TooManySteps {
                limit: MAX_EXECUTION_STEPS,
            })?;
        let mut execution_steps = Vec::with_capacity(planned as usize);

        match test_plan.repetition_strategy {
            RepetitionStrategy::EntireSuite => {
                for repetition in 0..test_plan.repetitions {
                    for step in &test_plan.steps {
                        for step_repetition in 0..step.repetitions {
                            expand_step(
                                &test_plan,
                                step,
                                repetition,
                                step_repetition,
                                &mut execution_steps,
                            );
                        }
                    }
                }
            }
            RepetitionStrategy::PerStep => {
                for step in &test_plan.steps {
                    let runs = step
                        .repetitions
                        .checked_mul(test_plan.repetitions)
                        .ok_or(PlanError::TooManySteps {
                            limit: MAX_EXECUTION_STEPS,
                        })?;
                    for step_repetition in 0..runs {
                        expand_step(&test_plan, step, 0, step_repetition, &mut execution_steps);
                    }
                }
            }
        }

        tracing::debug!(
            steps = test_plan.steps.len(),
            execution_steps = execution_steps.len(),
            "Planned execution"
        );
        Ok(Self {
            test_plan,
            execution_steps,
        })
    }

    pub fn len(&self) -> usize {
        self.execution_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_steps.is_empty()
    }
}

/// Number of steps `plan` expands to, `None` on overflow.
fn planned_step_count(plan: &SessionTestPlan) -> Option<u64> {
    plan.steps.iter().try_fold(0u64, |total, step| {
        let per_run = match plan.recording_strategy {
            RecordingStrategy::PerStep => 1,
            RecordingStrategy::PerTest => step.test_cases.len() as u64,
        };
        u64::from(step.repetitions)
            .checked_mul(u64::from(plan.repetitions))?
            .checked_mul(per_run)?
            .checked_add(total)
    })
}

fn expand_step(
    plan: &SessionTestPlan,
    step: &PlanStep,
    plan_repetition: u32,
    step_repetition: u32,
    out: &mut Vec<ExecutionStep>,
) {
    let recording_start_strategy = step
        .recording_start_strategy
        .unwrap_or(plan.recording_start_strategy);
    let reinstall_app = step.reinstall_app.unwrap_or(plan.reinstall_app);
    let metrics = step.metrics.clone().unwrap_or_else(|| plan.metrics.clone());

    let make = |test_cases: Vec<StepTestCase>, reinstall_app: bool| ExecutionStep {
        plan_repetition,
        step: step.clone(),
        step_repetition,
        recording_start_strategy,
        reinstall_app,
        metrics: metrics.clone(),
        test_cases,
        end_on_failure: plan.end_on_failure,
    };

    match plan.recording_strategy {
        RecordingStrategy::PerStep => out.push(make(step.test_cases.clone(), reinstall_app)),
        RecordingStrategy::PerTest => {
            for (idx, test_case) in step.test_cases.iter().enumerate() {
                out.push(make(vec![test_case.clone()], reinstall_app && idx == 0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::plan::XctestrunConfig;

    fn plan(strategy: RepetitionStrategy, repetitions: u32, steps: Vec<PlanStep>) -> SessionTestPlan {
        SessionTestPlan {
            name: None,
            xctestrun_config: XctestrunConfig {
                path: "App.xctestrun".into(),
                test_configuration: "Default".into(),
            },
            end_on_failure: false,
            repetitions,
            repetition_strategy: strategy,
            metrics: vec![Metric::Cpu],
            recording_strategy: RecordingStrategy::PerStep,
            recording_start_strategy: RecordingStartStrategy::Launch,
            reinstall_app: false,
            steps,
        }
    }

    fn step(order: u32, repetitions: u32, ids: &[&str]) -> PlanStep {
        let mut step = PlanStep::new(order, ids.iter().map(|id| StepTestCase::new(*id)).collect());
        step.repetitions = repetitions;
        step
    }

    fn coords(plan: &ExecutionPlan) -> Vec<(u32, u32, u32)> {
        plan.execution_steps
            .iter()
            .map(|s| (s.plan_repetition, s.order(), s.step_repetition))
            .collect()
    }

    #[test]
    fn test_entire_suite_order() {
        let plan = ExecutionPlan::from_test_plan(plan(
            RepetitionStrategy::EntireSuite,
            2,
            vec![step(0, 2, &["T/C/a"]), step(1, 1, &["T/C/b"])],
        ))
        .unwrap();

        assert_eq!(
            coords(&plan),
            vec![
                (0, 0, 0),
                (0, 0, 1),
                (0, 1, 0),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
            ]
        );
    }

    #[test]
    fn test_per_step_order() {
        let plan = ExecutionPlan::from_test_plan(plan(
            RepetitionStrategy::PerStep,
            2,
            vec![step(0, 2, &["T/C/a"]), step(1, 1, &["T/C/b"])],
        ))
        .unwrap();

        assert_eq!(
            coords(&plan),
            vec![(0, 0, 0), (0, 0, 1), (0, 0, 2), (0, 0, 3), (0, 1, 0), (0, 1, 1)]
        );
    }

    #[test]
    fn test_per_test_recording_reinstalls_once() {
        let mut test_plan = plan(
            RepetitionStrategy::EntireSuite,
            1,
            vec![step(0, 1, &["T/C/a", "T/C/b", "T/C/c"])],
        );
        test_plan.recording_strategy = RecordingStrategy::PerTest;
        test_plan.reinstall_app = true;

        let plan = ExecutionPlan::from_test_plan(test_plan).unwrap();
        assert_eq!(plan.len(), 3);
        let reinstall: Vec<bool> = plan.execution_steps.iter().map(|s| s.reinstall_app).collect();
        assert_eq!(reinstall, vec![true, false, false]);
        assert_eq!(plan.execution_steps[1].only_testing(), vec!["T/C/b"]);
    }

    #[test]
    fn test_step_overrides() {
        let mut overriding = step(0, 1, &["T/C/a"]);
        overriding.metrics = Some(vec![]);
        overriding.recording_start_strategy = Some(RecordingStartStrategy::Attach);
        overriding.reinstall_app = Some(true);

        let mut test_plan = plan(
            RepetitionStrategy::EntireSuite,
            1,
            vec![overriding, step(1, 1, &["T/C/b"])],
        );
        test_plan.end_on_failure = true;

        let plan = ExecutionPlan::from_test_plan(test_plan).unwrap();
        let (first, second) = (&plan.execution_steps[0], &plan.execution_steps[1]);

        assert!(first.metrics.is_empty());
        assert_eq!(first.recording_start_strategy, RecordingStartStrategy::Attach);
        assert!(first.reinstall_app);

        assert_eq!(second.metrics, vec![Metric::Cpu]);
        assert_eq!(second.recording_start_strategy, RecordingStartStrategy::Launch);
        assert!(!second.reinstall_app);
        assert!(second.end_on_failure);
    }

    #[test]
    fn test_invalid_plan_is_rejected() {
        let result = ExecutionPlan::from_test_plan(plan(RepetitionStrategy::PerStep, 1, vec![]));
        assert!(matches!(result, Err(PlanError::NoSteps)));
    }

    #[test]
    fn test_oversized_plan_is_rejected() {
        let huge = plan(
            RepetitionStrategy::PerStep,
            65536,
            vec![step(0, 65536, &["App/Suite/testA"])],
        );
        assert!(matches!(
            ExecutionPlan::from_test_plan(huge),
            Err(PlanError::TooManySteps { limit }) if limit == MAX_EXECUTION_STEPS
        ));

        let wide = plan(
            RepetitionStrategy::EntireSuite,
            1000,
            vec![step(0, 101, &["App/Suite/testA"])],
        );
        assert!(matches!(
            ExecutionPlan::from_test_plan(wide),
            Err(PlanError::TooManySteps { .. })
        ));
    }

    #[test]
    fn test_plan_at_step_limit_expands() {
        let plan = plan(
            RepetitionStrategy::PerStep,
            1000,
            vec![step(0, 100, &["App/Suite/testA"])],
        );
        let expanded = ExecutionPlan::from_test_plan(plan).unwrap();
        assert_eq!(expanded.len() as u64, MAX_EXECUTION_STEPS);
        assert_eq!(expanded.execution_steps.last().unwrap().step_repetition, 99_999);
    }
}
