//! `xcodebuild` invocations.

use crate::error::CommandError;
use crate::process::ProcessCommand;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Main action passed to `xcodebuild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcodebuildAction {
    Build,
    BuildForTesting,
    Clean,
    Test,
    TestWithoutBuilding,
}

impl XcodebuildAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::BuildForTesting => "build-for-testing",
            Self::Clean => "clean",
            Self::Test => "test",
            Self::TestWithoutBuilding => "test-without-building",
        }
    }
}

impl FromStr for XcodebuildAction {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "build-for-testing" => Ok(Self::BuildForTesting),
            "clean" => Ok(Self::Clean),
            "test" => Ok(Self::Test),
            "test-without-building" => Ok(Self::TestWithoutBuilding),
            other => Err(CommandError::InvalidArgument(format!(
                "unknown xcodebuild action: {other}"
            ))),
        }
    }
}

/// A `-destination` specifier, rendered as comma-separated `key=value` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Destination {
    pairs: Vec<(String, String)>,
}

impl Destination {
    pub fn new() -> Self {
        Self::default()
    }

    /// A physical iOS device identified by UDID.
    pub fn ios(udid: impl Into<String>) -> Self {
        Self::new().with("platform", "iOS").with("id", udid)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumerationStyle {
    #[default]
    Flat,
    Hierarchical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumerationFormat {
    #[default]
    Json,
    Text,
}

/// Options understood by `xcodebuild`. See `man xcodebuild`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XcodebuildOption {
    Quiet,
    Project(PathBuf),
    Workspace(PathBuf),
    Scheme(String),
    Target(String),
    Destination(Destination),
    /// Seconds to wait for the destination to become available.
    DestinationTimeout(u32),
    DerivedDataPath(PathBuf),
    ResultBundlePath(PathBuf),
    List,
    Xctestrun(PathBuf),
    OnlyTestConfiguration(String),
    OnlyTesting(String),
    SkipTesting(String),
    EnumerateTests {
        style: EnumerationStyle,
        format: EnumerationFormat,
        output: PathBuf,
    },
}

impl XcodebuildOption {
    fn push_args(&self, args: &mut Vec<String>) {
        let mut flag = |name: &str, value: Option<String>| {
            args.push(name.to_string());
            if let Some(value) = value {
                args.push(value);
            }
        };
        match self {
            Self::Quiet => flag("-quiet", None),
            Self::Project(p) => flag("-project", Some(p.display().to_string())),
            Self::Workspace(p) => flag("-workspace", Some(p.display().to_string())),
            Self::Scheme(s) => flag("-scheme", Some(s.clone())),
            Self::Target(t) => flag("-target", Some(t.clone())),
            Self::Destination(d) => flag("-destination", Some(d.to_string())),
            Self::DestinationTimeout(secs) => flag("-destination-timeout", Some(secs.to_string())),
            Self::DerivedDataPath(p) => flag("-derivedDataPath", Some(p.display().to_string())),
            Self::ResultBundlePath(p) => flag("-resultBundlePath", Some(p.display().to_string())),
            Self::List => flag("-list", None),
            Self::Xctestrun(p) => flag("-xctestrun", Some(p.display().to_string())),
            Self::OnlyTestConfiguration(c) => flag("-only-test-configuration", Some(c.clone())),
            Self::OnlyTesting(t) => flag("-only-testing", Some(t.clone())),
            Self::SkipTesting(t) => flag("-skip-testing", Some(t.clone())),
            Self::EnumerateTests {
                style,
                format,
                output,
            } => {
                flag("-enumerate-tests", None);
                let style = match style {
                    EnumerationStyle::Flat => "flat",
                    EnumerationStyle::Hierarchical => "hierarchical",
                };
                flag("-test-enumeration-style", Some(style.into()));
                let format = match format {
                    EnumerationFormat::Json => "json",
                    EnumerationFormat::Text => "text",
                };
                flag("-test-enumeration-format", Some(format.into()));
                flag(
                    "-test-enumeration-output-path",
                    Some(output.display().to_string()),
                );
            }
        }
    }
}

/// A general `xcodebuild` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XcodebuildCommand {
    action: Option<XcodebuildAction>,
    options: Vec<XcodebuildOption>,
}

impl XcodebuildCommand {
    /// Not every invocation needs an action (`-list`, for one).
    pub fn new(action: Option<XcodebuildAction>) -> Self {
        Self {
            action,
            options: Vec::new(),
        }
    }

    pub fn option(mut self, option: XcodebuildOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = XcodebuildOption>) -> Self {
        self.options.extend(options);
        self
    }
}

impl ProcessCommand for XcodebuildCommand {
    fn parse(&self) -> Vec<String> {
        let mut args = vec!["xcodebuild".to_string()];
        if let Some(action) = self.action {
            args.push(action.as_str().into());
        }
        for option in &self.options {
            option.push_args(&mut args);
        }
        args
    }
}

/// Runs prebuilt tests from an `.xctestrun` file on a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcodebuildTestCommand {
    pub xctestrun: PathBuf,
    pub destination: Destination,
    pub scheme: Option<String>,
    pub test_configuration: Option<String>,
    pub result_bundle_path: Option<PathBuf>,
    pub only_testing: Vec<String>,
    pub skip_testing: Vec<String>,
}

impl XcodebuildTestCommand {
    pub fn new(xctestrun: impl Into<PathBuf>, destination: Destination) -> Self {
        Self {
            xctestrun: xctestrun.into(),
            destination,
            scheme: None,
            test_configuration: None,
            result_bundle_path: None,
            only_testing: Vec::new(),
            skip_testing: Vec::new(),
        }
    }

    fn to_command(&self) -> XcodebuildCommand {
        let mut cmd = XcodebuildCommand::new(Some(XcodebuildAction::TestWithoutBuilding))
            .option(XcodebuildOption::Xctestrun(self.xctestrun.clone()));
        if let Some(scheme) = &self.scheme {
            cmd = cmd.option(XcodebuildOption::Scheme(scheme.clone()));
        }
        cmd = cmd.option(XcodebuildOption::Destination(self.destination.clone()));
        if let Some(configuration) = &self.test_configuration {
            cmd = cmd.option(XcodebuildOption::OnlyTestConfiguration(configuration.clone()));
        }
        if let Some(path) = &self.result_bundle_path {
            cmd = cmd.option(XcodebuildOption::ResultBundlePath(path.clone()));
        }
        cmd.options(
            self.only_testing
                .iter()
                .cloned()
                .map(XcodebuildOption::OnlyTesting),
        )
        .options(
            self.skip_testing
                .iter()
                .cloned()
                .map(XcodebuildOption::SkipTesting),
        )
    }
}

impl ProcessCommand for XcodebuildTestCommand {
    fn parse(&self) -> Vec<String> {
        self.to_command().parse()
    }
}

/// Lists the tests contained in an `.xctestrun` without running them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcodebuildTestEnumerationCommand {
    pub xctestrun: PathBuf,
    pub destination: Destination,
    pub style: EnumerationStyle,
    pub format: EnumerationFormat,
    pub output_path: PathBuf,
}

impl XcodebuildTestEnumerationCommand {
    pub fn new(
        xctestrun: impl Into<PathBuf>,
        destination: Destination,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            xctestrun: xctestrun.into(),
            destination,
            style: EnumerationStyle::Flat,
            format: EnumerationFormat::Json,
            output_path: output_path.into(),
        }
    }
}

impl ProcessCommand for XcodebuildTestEnumerationCommand {
    fn parse(&self) -> Vec<String> {
        XcodebuildCommand::new(Some(XcodebuildAction::TestWithoutBuilding))
            .option(XcodebuildOption::Xctestrun(self.xctestrun.clone()))
            .option(XcodebuildOption::Destination(self.destination.clone()))
            .option(XcodebuildOption::DestinationTimeout(1))
            .option(XcodebuildOption::EnumerateTests {
                style: self.style,
                format: self.format,
                output: self.output_path.clone(),
            })
            .parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UDID: &str = "00008030-001A2D3E0C38802E";

    #[test]
    fn test_build_command() {
        let cmd = XcodebuildCommand::new(Some(XcodebuildAction::Build))
            .option(XcodebuildOption::Quiet)
            .option(XcodebuildOption::Project("/tmp/project".into()));
        assert_eq!(
            cmd.parse(),
            vec!["xcodebuild", "build", "-quiet", "-project", "/tmp/project"]
        );
    }

    #[test]
    fn test_command_without_action() {
        let cmd = XcodebuildCommand::new(None).option(XcodebuildOption::List);
        assert_eq!(cmd.parse(), vec!["xcodebuild", "-list"]);
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!(
            "test-without-building".parse::<XcodebuildAction>().unwrap(),
            XcodebuildAction::TestWithoutBuilding
        );
        assert!("invalid".parse::<XcodebuildAction>().is_err());
    }

    #[test]
    fn test_destination_format() {
        let dest = Destination::new()
            .with("platform", "iOS Simulator")
            .with("name", "iPhone 15");
        assert_eq!(dest.to_string(), "platform=iOS Simulator,name=iPhone 15");
        assert_eq!(Destination::ios(UDID).to_string(), format!("platform=iOS,id={UDID}"));
        assert_eq!(Destination::new().to_string(), "");
    }

    #[test]
    fn test_test_command() {
        let mut cmd = XcodebuildTestCommand::new("/tmp/project", Destination::ios(UDID));
        cmd.scheme = Some("Release".into());
        cmd.only_testing = vec!["test1".into(), "test2".into()];
        cmd.skip_testing = vec!["test3".into(), "test4".into()];
        let dest = format!("platform=iOS,id={UDID}");
        assert_eq!(
            cmd.parse(),
            vec![
                "xcodebuild",
                "test-without-building",
                "-xctestrun",
                "/tmp/project",
                "-scheme",
                "Release",
                "-destination",
                dest.as_str(),
                "-only-testing",
                "test1",
                "-only-testing",
                "test2",
                "-skip-testing",
                "test3",
                "-skip-testing",
                "test4",
            ]
        );
    }

    #[test]
    fn test_test_command_with_configuration_and_bundle() {
        let mut cmd = XcodebuildTestCommand::new("/tmp/run.xctestrun", Destination::ios(UDID));
        cmd.test_configuration = Some("Default".into());
        cmd.result_bundle_path = Some("/tmp/out/abc.xcresult".into());
        let args = cmd.parse();
        let pos = args
            .iter()
            .position(|a| a == "-only-test-configuration")
            .unwrap();
        assert_eq!(args[pos + 1], "Default");
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out/abc.xcresult"));
    }

    #[test]
    fn test_enumeration_command() {
        let cmd = XcodebuildTestEnumerationCommand::new(
            "/tmp/project",
            Destination::ios(UDID),
            "/tmp/test_enumeration.json",
        );
        let dest = format!("platform=iOS,id={UDID}");
        assert_eq!(
            cmd.parse(),
            vec![
                "xcodebuild",
                "test-without-building",
                "-xctestrun",
                "/tmp/project",
                "-destination",
                dest.as_str(),
                "-destination-timeout",
                "1",
                "-enumerate-tests",
                "-test-enumeration-style",
                "flat",
                "-test-enumeration-format",
                "json",
                "-test-enumeration-output-path",
                "/tmp/test_enumeration.json",
            ]
        );
    }
}
