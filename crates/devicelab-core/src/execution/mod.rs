//! Test plans, their expansion into execution steps, and step identifiers.
//!
//! ```text
//! SessionTestPlan ──validated──▶ ExecutionPlan ──▶ SessionState
//!                                 (ExecutionStep*)   (status + hash per step)
//! ```

mod hasher;
mod plan;
mod state;
mod steps;

pub use hasher::{hash, hash_session_execution_step, step_key};
pub use plan::{
    instruments_for, Metric, PlanStep, RecordingStartStrategy, RecordingStrategy,
    RepetitionStrategy, SessionTestPlan, StepTestCase, XctestrunConfig,
};
pub use state::{ExecutionStepState, SessionState, StepStatus};
pub use steps::{ExecutionPlan, ExecutionStep, MAX_EXECUTION_STEPS};
