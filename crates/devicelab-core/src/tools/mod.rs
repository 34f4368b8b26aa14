//! Runners for the build driver and the result-bundle query tool.

mod xcodebuild;
mod xcresult;

pub use xcodebuild::{TestEnumeration, TestOverview, Xcodebuild};
pub use xcresult::{
    TestDevice, TestFailure, TestNode, TestPlanConfiguration, TestResultSummary, TestResults,
    XcresultTool,
};
