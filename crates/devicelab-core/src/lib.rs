//! # devicelab-core
//!
//! Orchestration layer for a lab of physical iOS devices.
//!
//! This crate supervises the external tools a test lab depends on, keeps at
//! most one tunnel per device through a sidecar tunnel server, and turns test
//! plans into hashed execution steps run as background jobs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  devicelab-core (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │   DeviceLab     │────▶│  JobRunner               │    │
//! │  │ - submit_session│     │  HashMap<JobId, JobEntry>│    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ DeviceManager   │────▶│  Device                  │    │
//! │  │ - get_device()  │     │  (DeviceProtocol via     │    │
//! │  └─────────────────┘     │   BlockingPool)          │    │
//! │                          └──────────────────────────┘    │
//! │  ┌─────────────────┐                │ tunnel state       │
//! │  │ TunnelManager   │◀───────────────┘                    │
//! │  │ - create_tunnel │     ┌──────────────────────────┐    │
//! │  │ - get_tunnel    │────▶│  TunnelClient            │    │
//! │  └─────────────────┘     │  (framed TCP)            │    │
//! │                          └──────────────────────────┘    │
//! │  ExecutionPlan ─▶ SessionState ─▶ xcodebuild/xcresult    │
//! │                    (murmur3 step hashes)     (Process)   │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 devicelab-tunneld (sidecar)              │
//! │            127.0.0.1:49151, one tunnel per device        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use devicelab_core::{DeviceLab, LabConfig, SessionTestPlan};
//!
//! # async fn example(discovery: std::sync::Arc<dyn devicelab_core::DeviceDiscovery>)
//! #     -> devicelab_core::Result<()> {
//! let lab = DeviceLab::new(LabConfig::from_env()?, discovery)?;
//! lab.start().await?;
//!
//! let plan: SessionTestPlan = serde_json::from_str(&std::fs::read_to_string("plan.json")?)?;
//! let mut run = lab.submit_session("00008110-001A2B3C4D5E6F70", plan).await?;
//! run.job.wait().await;
//!
//! for step in &run.state.read().await.steps {
//!     println!("{} {:?}", step.hash, step.status);
//! }
//!
//! lab.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Process Supervision**: Launch, signal and reap external tools
//! - **Tunnel Brokering**: At most one tunnel per device, enforced server-side
//! - **Device Readiness**: Pairing, developer mode, disk image and tunnel checks
//! - **Execution Planning**: Repetition and recording strategies with stable step hashes
//! - **Background Jobs**: Id-keyed jobs with captured failures

pub mod codec;
pub mod commands;
mod config;
pub mod device;
mod error;
pub mod execution;
mod jobs;
mod lab;
mod offload;
pub mod process;
pub mod tools;
pub mod tunnel;

pub use codec::{Codec, JsonCodec};
pub use config::{LabConfig, LabConfigBuilder, TunnelManagerConfig, TunnelManagerConfigBuilder};
pub use device::{
    Device, DeviceDiscovery, DeviceInfo, DeviceManager, DeviceProtocol, DeviceStatus,
    InstalledApp, ProductVersion,
};
pub use error::{
    CodecError, CommandError, ConfigError, CoreError, DeviceError, JobError, PlanError,
    ProcessError, Result, TunnelError, XcodebuildError, XcresultError,
};
pub use execution::{
    hash, hash_session_execution_step, ExecutionPlan, ExecutionStep, SessionState,
    SessionTestPlan, StepStatus,
};
pub use jobs::{JobHandle, JobRunner, JobState, JobStats};
pub use lab::{DeviceLab, SessionRun, StepContext, StepRunner, XcodebuildStepRunner};
pub use offload::{BlockingPool, PoolStats};
pub use process::{run_process, Process, ProcessCommand, ProcessOutput};
pub use tunnel::{TunnelClient, TunnelDescriptor, TunnelManager, TunnelServer};
