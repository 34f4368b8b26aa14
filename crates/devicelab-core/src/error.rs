//! Error types for devicelab-core.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for devicelab-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Top-level error for operations that span several components.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Xcodebuild(#[from] XcodebuildError),

    #[error(transparent)]
    Xcresult(#[from] XcresultError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A payload could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The raw bytes did not form a valid message. The payload is kept for diagnosis.
    #[error("invalid socket message: {reason}")]
    InvalidMessage {
        /// Offending bytes as received.
        payload: Vec<u8>,
        /// Why the payload was rejected.
        reason: String,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    pub(crate) fn invalid(payload: &[u8], reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            payload: payload.to_vec(),
            reason: reason.into(),
        }
    }

    /// The offending payload, if this is a decode failure.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::InvalidMessage { payload, .. } => Some(payload),
            Self::Encode(_) => None,
        }
    }
}

/// Errors from the process supervisor.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The command resolved to an empty argument vector.
    #[error("command is empty")]
    EmptyCommand,

    /// The executable could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process is already running")]
    AlreadyRunning,

    #[error("process has not been started")]
    NotStarted,

    /// The return code was read before the process exited.
    #[error("process has not exited yet")]
    NotExited,

    #[error("failed to signal process: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// The process exited with a non-zero code.
    #[error("process exited with code {return_code}")]
    Failed {
        stdout: Vec<String>,
        stderr: Vec<String>,
        return_code: i32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command builder was given invalid parameters.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
}

/// Errors from running the build driver.
#[derive(Debug, Error)]
pub enum XcodebuildError {
    /// Non-zero exit from xcodebuild.
    #[error("xcodebuild exited with code {return_code}")]
    Failed {
        stdout: Vec<String>,
        stderr: Vec<String>,
        return_code: i32,
    },

    /// Test enumeration produced a result that carries embedded errors.
    #[error("test enumeration failed: {}", errors.join("; "))]
    ListEnumerationFailure {
        stdout: Vec<String>,
        stderr: Vec<String>,
        errors: Vec<String>,
    },

    /// A file produced or consumed by xcodebuild could not be parsed.
    #[error("invalid content in {}: {reason}", path.display())]
    InvalidFileContent { path: PathBuf, reason: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Errors from querying result bundles.
#[derive(Debug, Error)]
pub enum XcresultError {
    #[error("xcresulttool exited with code {return_code}")]
    Failed {
        stdout: Vec<String>,
        stderr: Vec<String>,
        return_code: i32,
    },

    /// Compact JSON output must be a single line.
    #[error("expected a single line of output, got {0}")]
    UnexpectedOutput(usize),

    #[error("invalid result bundle content: {0}")]
    InvalidContent(#[from] serde_json::Error),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Errors from the tunnel server, client, and manager.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A live tunnel already exists for this device.
    #[error("tunnel already exists for device {udid}")]
    AlreadyExists { udid: String },

    #[error("device not found: {udid}")]
    DeviceNotFound { udid: String },

    #[error("no device connected")]
    NoDeviceConnected,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal tunnel server error: {0}")]
    Internal(String),

    /// The provider failed to bring a tunnel up or down.
    #[error("tunnel provider error: {0}")]
    Provider(String),

    /// The server answered with a code this client does not know.
    #[error("tunnel server error {code}: {message}")]
    Remote { code: u16, message: String },

    /// A frame could not be decoded. Distinct from transport failures.
    #[error(transparent)]
    InvalidMessage(#[from] CodecError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("tunnel server did not respond within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by tunnel server")]
    Closed,

    #[error("tunnel manager is not started")]
    NotStarted,

    #[error("tunnel manager is already started")]
    AlreadyStarted,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the device abstraction and its collaborator.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("pairing failed: {0}")]
    Pairing(String),

    #[error("user denied pairing")]
    UserDeniedPairing,

    #[error("device {0} is not paired")]
    NotPaired(String),

    #[error("device is locked with a password")]
    PasswordRequired,

    #[error("developer mode is not supported on product version {0}")]
    DeveloperModeNotSupported(String),

    #[error("developer mode is not enabled")]
    DeveloperModeNotEnabled,

    #[error("developer mode is already enabled")]
    DeveloperModeAlreadyEnabled,

    #[error("developer mode cannot be enabled while a passcode is set")]
    PasscodeSet,

    #[error("developer mode error: {0}")]
    DeveloperMode(String),

    #[error("failed to mount developer disk image: {0}")]
    DdiMounting(String),

    #[error("developer disk image is not mounted")]
    DdiNotMounted,

    #[error("developer disk image is already mounted")]
    DdiAlreadyMounted,

    /// Tunnels exist only from product version 17.0.
    #[error("tunnels are not supported on product version {0}")]
    TunnelNotSupported(String),

    #[error("no tunnel established to the device")]
    TunnelNotConnected,

    #[error("device is not ready for developer tools: {0}")]
    NotReadyForDvt(#[source] Box<DeviceError>),

    #[error("failed to create tunnel to {udid}: {source}")]
    TunnelCreationFailure {
        udid: String,
        #[source]
        source: TunnelError,
    },

    #[error("failed to install app: {0}")]
    AppInstall(String),

    #[error("failed to uninstall app: {0}")]
    AppUninstall(String),

    #[error("failed to list apps: {0}")]
    AppList(String),

    #[error("failed to launch app: {0}")]
    AppLaunch(String),

    #[error("failed to terminate app: {0}")]
    AppTerminate(String),

    #[error("invalid product version: {0}")]
    InvalidVersion(String),

    /// Any other failure reported by the device-protocol collaborator.
    #[error("device protocol error: {0}")]
    Protocol(String),

    /// The blocking worker running the call was lost.
    #[error("blocking task failed: {0}")]
    Offload(String),
}

/// Errors from the job runner.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} is already scheduled")]
    Duplicate(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job runner is shut down")]
    ShutDown,
}

/// A test plan failed validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("test plan must contain at least one step")]
    NoSteps,

    #[error("repetitions must be at least 1, got {0}")]
    InvalidRepetitions(u32),

    #[error("steps must be ordered sequentially from 0: expected {expected}, found {found}")]
    StepOrder { expected: u32, found: u32 },

    #[error("step {0} has no test cases")]
    EmptyStep(u32),

    #[error("invalid test case id {0:?}: expected Target/Class/method")]
    InvalidTestCase(String),

    #[error("all test cases in step {0} must be from the same test target")]
    MixedTestTargets(u32),

    #[error("test plan expands to more than {limit} execution steps")]
    TooManySteps { limit: u64 },
}

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tunnel server program is empty")]
    EmptyProgram,

    #[error("tunnel server port must be non-zero")]
    InvalidPort,

    #[error("tunnel provider command is empty")]
    EmptyProvider,

    #[error("{0} must be > 0")]
    Zero(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}
