//! Typed queries against result bundles through `xcresulttool`.

use crate::commands::XcresultToolCommand;
use crate::error::{ProcessError, XcresultError};
use crate::process::run_process;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Reads test results out of an `.xcresult` bundle.
#[derive(Debug, Clone)]
pub struct XcresultTool {
    path: PathBuf,
}

impl XcresultTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a query and return its single line of compact JSON.
    pub async fn get_raw(command: XcresultToolCommand) -> Result<String, XcresultError> {
        let output = run_process(command, None).await.map_err(|e| match e {
            ProcessError::Failed {
                stdout,
                stderr,
                return_code,
            } => XcresultError::Failed {
                stdout,
                stderr,
                return_code,
            },
            other => other.into(),
        })?;
        single_line(output.stdout)
    }

    pub async fn tests(&self) -> Result<TestResults, XcresultError> {
        let raw = Self::get_raw(XcresultToolCommand::tests(&self.path)?).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn summary(&self) -> Result<TestResultSummary, XcresultError> {
        let raw = Self::get_raw(XcresultToolCommand::summary(&self.path)?).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn single_line(mut lines: Vec<String>) -> Result<String, XcresultError> {
    if lines.len() != 1 {
        return Err(XcresultError::UnexpectedOutput(lines.len()));
    }
    Ok(lines.remove(0))
}

/// `xcresulttool get test-results summary`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultSummary {
    pub title: String,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub finish_time: Option<f64>,
    /// Passed, Failed, Skipped, Expected Failure or unknown.
    pub result: String,
    pub total_test_count: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub skipped_tests: u32,
    pub expected_failures: u32,
    #[serde(default)]
    pub test_failures: Vec<TestFailure>,
}

impl TestResultSummary {
    pub fn passed(&self) -> bool {
        self.result == "Passed"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailure {
    pub test_name: String,
    pub target_name: String,
    pub failure_text: String,
    #[serde(default)]
    pub test_identifier: Option<u64>,
}

/// `xcresulttool get test-results tests`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    #[serde(default)]
    pub test_plan_configurations: Vec<TestPlanConfiguration>,
    #[serde(default)]
    pub devices: Vec<TestDevice>,
    #[serde(default)]
    pub test_nodes: Vec<TestNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPlanConfiguration {
    pub configuration_id: String,
    pub configuration_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDevice {
    #[serde(default)]
    pub device_id: Option<String>,
    pub device_name: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// A node of the test tree: plan, bundle, suite, test case, repetition, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    #[serde(default)]
    pub node_identifier: Option<String>,
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub children: Vec<TestNode>,
}

impl TestNode {
    /// All test-case nodes below (and including) this one, depth first.
    pub fn test_cases(&self) -> Vec<&TestNode> {
        let mut out = Vec::new();
        self.collect_test_cases(&mut out);
        out
    }

    fn collect_test_cases<'a>(&'a self, out: &mut Vec<&'a TestNode>) {
        if self.node_type == "Test Case" {
            out.push(self);
        }
        for child in &self.children {
            child.collect_test_cases(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        assert_eq!(single_line(vec!["{}".into()]).unwrap(), "{}");
        assert!(matches!(
            single_line(vec![]),
            Err(XcresultError::UnexpectedOutput(0))
        ));
        assert!(matches!(
            single_line(vec!["{".into(), "}".into()]),
            Err(XcresultError::UnexpectedOutput(2))
        ));
    }

    #[test]
    fn test_parse_summary() {
        let raw = r#"{"title":"Test - App","startTime":1718000000.5,"finishTime":1718000100.0,"environmentDescription":"App · Debug","result":"Failed","totalTestCount":3,"passedTests":2,"failedTests":1,"skippedTests":0,"expectedFailures":0,"statistics":[],"devicesAndConfigurations":[],"testFailures":[{"testName":"testLogin()","targetName":"AppTests","failureText":"XCTAssertTrue failed","testIdentifier":7}]}"#;
        let summary: TestResultSummary = serde_json::from_str(raw).unwrap();
        assert!(!summary.passed());
        assert_eq!(summary.total_test_count, 3);
        assert_eq!(summary.test_failures.len(), 1);
        assert_eq!(summary.test_failures[0].test_identifier, Some(7));
    }

    #[test]
    fn test_collect_test_cases() {
        let raw = r#"{"testNodes":[{"nodeType":"Test Plan","name":"Plan","children":[
            {"nodeType":"Unit test bundle","name":"AppTests","children":[
                {"nodeType":"Test Suite","name":"MyTests","children":[
                    {"nodeType":"Test Case","name":"testLogin()","nodeIdentifier":"MyTests/testLogin()","result":"Passed"},
                    {"nodeType":"Test Case","name":"testLogout()","nodeIdentifier":"MyTests/testLogout()","result":"Failed"}
                ]}
            ]}
        ]}]}"#;
        let results: TestResults = serde_json::from_str(raw).unwrap();
        let cases = results.test_nodes[0].test_cases();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].result.as_deref(), Some("Failed"));
    }
}
