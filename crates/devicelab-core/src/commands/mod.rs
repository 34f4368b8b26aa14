//! Argument-vector builders for the external tools the lab drives.
//!
//! Every builder implements [`ProcessCommand`](crate::process::ProcessCommand)
//! and is pure: validation happens at construction, `parse()` only formats.

mod tunnel;
mod xcodebuild;
mod xcresult;
mod xctrace;

pub use tunnel::TunnelServerCommand;
pub use xcodebuild::{
    Destination, EnumerationFormat, EnumerationStyle, XcodebuildAction, XcodebuildCommand,
    XcodebuildOption, XcodebuildTestCommand, XcodebuildTestEnumerationCommand,
};
pub use xcresult::{XcresultQuery, XcresultToolCommand};
pub use xctrace::{Instrument, RecordTarget, XctraceCommand};
