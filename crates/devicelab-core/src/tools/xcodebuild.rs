//! Running `xcodebuild` and reading its test enumeration output.
//!
//! A non-zero exit becomes [`XcodebuildError::Failed`] carrying the captured
//! output. `-enumerate-tests` results are written to a JSON file and parsed
//! into a [`TestOverview`].

use crate::commands::{Destination, XcodebuildTestEnumerationCommand};
use crate::error::{ProcessError, XcodebuildError};
use crate::process::{run_process, ProcessCommand, ProcessOutput};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

/// Runs `xcodebuild` invocations and interprets their results.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xcodebuild;

impl Xcodebuild {
    /// Run an `xcodebuild` command to completion.
    ///
    /// # Errors
    ///
    /// A non-zero exit becomes [`XcodebuildError::Failed`] carrying the
    /// captured stdout, stderr and exit code.
    pub async fn run(
        command: impl ProcessCommand + 'static,
        cwd: Option<&Path>,
    ) -> Result<ProcessOutput, XcodebuildError> {
        match run_process(command, cwd).await {
            Ok(output) => Ok(output),
            Err(ProcessError::Failed {
                stdout,
                stderr,
                return_code,
            }) => {
                tracing::error!(return_code, stderr_lines = stderr.len(), "xcodebuild failed");
                Err(XcodebuildError::Failed {
                    stdout,
                    stderr,
                    return_code,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate the tests in an `.xctestrun` without running them.
    ///
    /// The enumeration result is written by xcodebuild to `output_path` and
    /// removed once read.
    pub async fn enumerate_tests(
        xctestrun: impl Into<PathBuf>,
        destination: Destination,
        output_path: &Path,
    ) -> Result<TestOverview, XcodebuildError> {
        let command =
            XcodebuildTestEnumerationCommand::new(xctestrun, destination, output_path);
        tracing::debug!(output = %output_path.display(), "Starting test enumeration");
        let output = Self::run(command, None).await?;

        let content = tokio::fs::read_to_string(output_path)
            .await
            .map_err(|e| XcodebuildError::InvalidFileContent {
                path: output_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if let Err(e) = tokio::fs::remove_file(output_path).await {
            tracing::debug!(error = %e, "Failed to remove enumeration output");
        }

        let result: TestEnumeration =
            serde_json::from_str(&content).map_err(|e| XcodebuildError::InvalidFileContent {
                path: output_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        result.into_overview(output, output_path)
    }
}

/// Raw `-enumerate-tests` JSON output.
#[derive(Debug, Clone, Deserialize)]
pub struct TestEnumeration {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub values: Vec<TestOverview>,
}

impl TestEnumeration {
    fn into_overview(
        mut self,
        output: ProcessOutput,
        path: &Path,
    ) -> Result<TestOverview, XcodebuildError> {
        if !self.errors.is_empty() {
            tracing::error!(errors = ?self.errors, "Test enumeration finished with errors");
            return Err(XcodebuildError::ListEnumerationFailure {
                stdout: output.stdout,
                stderr: output.stderr,
                errors: self.errors,
            });
        }
        if self.values.len() != 1 {
            return Err(XcodebuildError::InvalidFileContent {
                path: path.to_path_buf(),
                reason: format!("expected exactly one value, got {}", self.values.len()),
            });
        }
        Ok(self.values.remove(0))
    }
}

/// Tests found in one test plan.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOverview {
    pub test_plan: String,
    #[serde(deserialize_with = "identifiers")]
    pub enabled_tests: Vec<String>,
    #[serde(deserialize_with = "identifiers")]
    pub disabled_tests: Vec<String>,
}

fn identifiers<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    struct Entry {
        identifier: String,
    }
    let entries = Vec::<Entry>::deserialize(deserializer)?;
    Ok(entries.into_iter().map(|e| e.identifier).collect())
}
