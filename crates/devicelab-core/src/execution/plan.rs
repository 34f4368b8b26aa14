//! Test plans as submitted by users.

use crate::commands::Instrument;
use crate::error::PlanError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A metric recorded while tests run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cpu,
    Memory,
    Fps,
    Gpu,
}

impl Metric {
    /// The instrument that records this metric.
    pub fn instrument(&self) -> Instrument {
        match self {
            Self::Cpu | Self::Memory => Instrument::ActivityMonitor,
            Self::Fps | Self::Gpu => Instrument::CoreAnimationFps,
        }
    }
}

/// Instruments covering `metrics`, without duplicates, in first-seen order.
pub fn instruments_for(metrics: &[Metric]) -> Vec<Instrument> {
    let mut instruments = Vec::new();
    for metric in metrics {
        let instrument = metric.instrument();
        if !instruments.contains(&instrument) {
            instruments.push(instrument);
        }
    }
    instruments
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionStrategy {
    /// Repeat the whole plan.
    #[default]
    EntireSuite,
    /// Repeat each step in place.
    PerStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStrategy {
    /// One recording per step.
    #[default]
    PerStep,
    /// One recording per test case; each test case runs on its own.
    PerTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStartStrategy {
    /// Launch the app under the recorder, then run the tests.
    #[default]
    Launch,
    /// Run the tests and attach the recorder once the app is up.
    Attach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTestCase {
    /// `Target/Class/method`.
    pub xctest_id: String,
}

impl StepTestCase {
    pub fn new(xctest_id: impl Into<String>) -> Self {
        Self {
            xctest_id: xctest_id.into(),
        }
    }

    /// The test target part of the id.
    pub fn test_target(&self) -> &str {
        self.xctest_id.split('/').next().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let parts: Vec<&str> = self.xctest_id.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(PlanError::InvalidTestCase(self.xctest_id.clone()));
        }
        Ok(())
    }
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position in the plan, sequential from 0.
    pub order: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// Multiplies with the plan's repetitions.
    #[serde(default = "one")]
    pub repetitions: u32,
    pub test_cases: Vec<StepTestCase>,
    /// Overrides the plan metrics. `Some(vec![])` records nothing.
    #[serde(default)]
    pub metrics: Option<Vec<Metric>>,
    #[serde(default)]
    pub recording_start_strategy: Option<RecordingStartStrategy>,
    #[serde(default)]
    pub reinstall_app: Option<bool>,
}

impl PlanStep {
    pub fn new(order: u32, test_cases: Vec<StepTestCase>) -> Self {
        Self {
            order,
            name: None,
            repetitions: 1,
            test_cases,
            metrics: None,
            recording_start_strategy: None,
            reinstall_app: None,
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.repetitions < 1 {
            return Err(PlanError::InvalidRepetitions(self.repetitions));
        }
        let Some(first) = self.test_cases.first() else {
            return Err(PlanError::EmptyStep(self.order));
        };
        for test_case in &self.test_cases {
            test_case.validate()?;
            if test_case.test_target() != first.test_target() {
                return Err(PlanError::MixedTestTargets(self.order));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XctestrunConfig {
    pub path: PathBuf,
    /// Name of the test configuration inside the xctestrun file.
    pub test_configuration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTestPlan {
    #[serde(default)]
    pub name: Option<String>,
    pub xctestrun_config: XctestrunConfig,
    /// Stop the session at the first failed step.
    #[serde(default)]
    pub end_on_failure: bool,
    pub repetitions: u32,
    pub repetition_strategy: RepetitionStrategy,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub recording_strategy: RecordingStrategy,
    #[serde(default)]
    pub recording_start_strategy: RecordingStartStrategy,
    #[serde(default)]
    pub reinstall_app: bool,
    pub steps: Vec<PlanStep>,
}

impl SessionTestPlan {
    /// Validate the plan and sort its steps by order.
    ///
    /// # Errors
    ///
    /// Fails if there are no steps, a repetition count is 0, step orders are
    /// not exactly `0..n`, or a step's test cases are invalid.
    pub fn validated(mut self) -> Result<Self, PlanError> {
        if self.repetitions < 1 {
            return Err(PlanError::InvalidRepetitions(self.repetitions));
        }
        if self.steps.is_empty() {
            return Err(PlanError::NoSteps);
        }
        self.steps.sort_by_key(|s| s.order);
        for (expected, step) in self.steps.iter().enumerate() {
            let expected = expected as u32;
            if step.order != expected {
                return Err(PlanError::StepOrder {
                    expected,
                    found: step.order,
                });
            }
            step.validate()?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_json(steps: serde_json::Value) -> serde_json::Value {
        json!({
            "name": "Valid Test Plan",
            "xctestrun_config": { "path": "App.xctestrun", "test_configuration": "Default" },
            "repetitions": 1,
            "repetition_strategy": "entire_suite",
            "metrics": ["cpu"],
            "steps": steps,
        })
    }

    fn parse(value: serde_json::Value) -> Result<SessionTestPlan, PlanError> {
        serde_json::from_value::<SessionTestPlan>(value)
            .unwrap()
            .validated()
    }

    #[test]
    fn test_defaults_and_sorting() {
        let plan = parse(plan_json(json!([
            { "order": 1, "test_cases": [{ "xctest_id": "T/C/b" }] },
            { "order": 0, "test_cases": [{ "xctest_id": "T/C/a" }] },
        ])))
        .unwrap();

        assert_eq!(plan.recording_strategy, RecordingStrategy::PerStep);
        assert_eq!(plan.recording_start_strategy, RecordingStartStrategy::Launch);
        assert!(!plan.end_on_failure);
        assert_eq!(plan.steps[0].order, 0);
        assert_eq!(plan.steps[1].order, 1);
        assert_eq!(plan.steps[0].repetitions, 1);
    }

    #[test]
    fn test_step_order_must_be_sequential() {
        let result = parse(plan_json(json!([
            { "order": 0, "test_cases": [{ "xctest_id": "T/C/a" }] },
            { "order": 2, "test_cases": [{ "xctest_id": "T/C/b" }] },
        ])));
        assert!(matches!(
            result,
            Err(PlanError::StepOrder { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_missing_steps() {
        assert!(matches!(parse(plan_json(json!([]))), Err(PlanError::NoSteps)));
    }

    #[test]
    fn test_invalid_repetitions() {
        let mut value = plan_json(json!([{ "order": 0, "test_cases": [{ "xctest_id": "T/C/a" }] }]));
        value["repetitions"] = json!(0);
        assert!(matches!(parse(value), Err(PlanError::InvalidRepetitions(0))));
    }

    #[test]
    fn test_step_validation() {
        let mut step = PlanStep::new(0, vec![StepTestCase::new("T/C/a")]);
        step.validate().unwrap();

        step.repetitions = 0;
        assert!(matches!(step.validate(), Err(PlanError::InvalidRepetitions(0))));

        let step = PlanStep::new(3, vec![]);
        assert!(matches!(step.validate(), Err(PlanError::EmptyStep(3))));

        let step = PlanStep::new(0, vec![StepTestCase::new("InvalidFormat")]);
        assert!(matches!(step.validate(), Err(PlanError::InvalidTestCase(_))));

        let step = PlanStep::new(
            1,
            vec![StepTestCase::new("A/C/m"), StepTestCase::new("B/C/m")],
        );
        assert!(matches!(step.validate(), Err(PlanError::MixedTestTargets(1))));
    }

    #[test]
    fn test_metrics_map_to_unique_instruments() {
        assert!(instruments_for(&[]).is_empty());
        assert_eq!(
            instruments_for(&[Metric::Cpu, Metric::Memory]),
            vec![Instrument::ActivityMonitor]
        );
        assert_eq!(
            instruments_for(&[Metric::Fps, Metric::Cpu, Metric::Gpu, Metric::Memory]),
            vec![Instrument::CoreAnimationFps, Instrument::ActivityMonitor]
        );
    }

    #[test]
    fn test_unknown_metric_is_rejected() {
        assert!(serde_json::from_value::<Metric>(json!("invalid_metric")).is_err());
    }
}
