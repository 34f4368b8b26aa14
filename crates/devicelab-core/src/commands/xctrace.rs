//! `xctrace` recording and export.

use crate::error::CommandError;
use crate::process::ProcessCommand;
use std::path::PathBuf;

/// Instruments available for recording, as listed by `xctrace list instruments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    ActivityMonitor,
    CoreAnimationFps,
    StdoutStderr,
}

impl Instrument {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActivityMonitor => "Activity Monitor",
            Self::CoreAnimationFps => "Core Animation FPS",
            Self::StdoutStderr => "stdout/stderr",
        }
    }
}

/// What a recording is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordTarget {
    /// An already running process.
    Attach(u32),
    /// Bundle identifier or on-device app path to launch.
    Launch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XctraceCommand {
    Record {
        output: PathBuf,
        instruments: Vec<Instrument>,
        device: String,
        target: RecordTarget,
        append: bool,
    },
    Export {
        input: PathBuf,
        output: PathBuf,
        xpath: Option<String>,
        toc: bool,
    },
}

impl XctraceCommand {
    pub fn record(
        instruments: Vec<Instrument>,
        output: impl Into<PathBuf>,
        device: impl Into<String>,
        target: RecordTarget,
        append: bool,
    ) -> Result<Self, CommandError> {
        if instruments.is_empty() {
            return Err(CommandError::InvalidArgument(
                "at least one instrument is required for recording".into(),
            ));
        }
        Ok(Self::Record {
            output: output.into(),
            instruments,
            device: device.into(),
            target,
            append,
        })
    }

    /// Export the table of contents of a trace.
    pub fn export_toc(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self::Export {
            input: input.into(),
            output: output.into(),
            xpath: None,
            toc: true,
        }
    }

    /// Export the data selected by an XPath expression.
    pub fn export_data(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        xpath: impl Into<String>,
    ) -> Self {
        Self::Export {
            input: input.into(),
            output: output.into(),
            xpath: Some(xpath.into()),
            toc: false,
        }
    }
}

impl ProcessCommand for XctraceCommand {
    fn parse(&self) -> Vec<String> {
        match self {
            Self::Record {
                output,
                instruments,
                device,
                target,
                append,
            } => {
                let mut args = vec![
                    "xctrace".to_string(),
                    "record".into(),
                    "--output".into(),
                    output.display().to_string(),
                ];
                for instrument in instruments {
                    args.push("--instrument".into());
                    args.push(instrument.as_str().into());
                }
                args.push("--device".into());
                args.push(device.clone());
                if *append {
                    args.push("--append".into());
                }
                match target {
                    RecordTarget::Attach(pid) => {
                        args.push("--attach".into());
                        args.push(pid.to_string());
                    }
                    RecordTarget::Launch(app) => {
                        args.push("--launch".into());
                        args.push(app.clone());
                    }
                }
                args
            }
            Self::Export {
                input,
                output,
                xpath,
                toc,
            } => {
                let mut args = vec![
                    "xctrace".to_string(),
                    "export".into(),
                    "--output".into(),
                    output.display().to_string(),
                    "--input".into(),
                    input.display().to_string(),
                ];
                if let Some(xpath) = xpath {
                    args.push("--xpath".into());
                    args.push(xpath.clone());
                }
                if *toc {
                    args.push("--toc".into());
                }
                args
            }
        }
    }
}
