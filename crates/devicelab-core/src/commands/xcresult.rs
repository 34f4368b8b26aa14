//! `xcresulttool` queries against a result bundle.

use crate::error::CommandError;
use crate::process::ProcessCommand;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcresultQuery {
    /// Test tree with per-test outcomes.
    Tests,
    Summary,
}

impl XcresultQuery {
    fn args(&self) -> [&'static str; 2] {
        match self {
            Self::Tests => ["test-results", "tests"],
            Self::Summary => ["test-results", "summary"],
        }
    }
}

/// `xcrun xcresulttool get <query> --path <bundle> --compact`
///
/// `--compact` keeps the JSON output on a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcresultToolCommand {
    path: PathBuf,
    query: XcresultQuery,
}

impl XcresultToolCommand {
    pub fn new(path: impl Into<PathBuf>, query: XcresultQuery) -> Result<Self, CommandError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(CommandError::MissingArgument("xcresult path"));
        }
        Ok(Self { path, query })
    }

    pub fn tests(path: impl Into<PathBuf>) -> Result<Self, CommandError> {
        Self::new(path, XcresultQuery::Tests)
    }

    pub fn summary(path: impl Into<PathBuf>) -> Result<Self, CommandError> {
        Self::new(path, XcresultQuery::Summary)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProcessCommand for XcresultToolCommand {
    fn parse(&self) -> Vec<String> {
        let mut args = vec!["xcrun".to_string(), "xcresulttool".into(), "get".into()];
        args.extend(self.query.args().iter().map(|s| s.to_string()));
        args.push("--path".into());
        args.push(self.path.display().to_string());
        args.push("--compact".into());
        args
    }
}
