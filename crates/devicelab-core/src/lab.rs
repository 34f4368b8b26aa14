//! Process-wide context tying devices, tunnels and jobs together.

use crate::commands::{Destination, XcodebuildTestCommand};
use crate::config::LabConfig;
use crate::device::{Device, DeviceDiscovery, DeviceManager};
use crate::error::{ConfigError, CoreError, XcodebuildError};
use crate::execution::{ExecutionPlan, ExecutionStep, SessionState, SessionTestPlan};
use crate::jobs::{JobHandle, JobRunner};
use crate::offload::BlockingPool;
use crate::tools::{Xcodebuild, XcresultTool};
use crate::tunnel::TunnelManager;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ============================================================================
// Step runner
// ============================================================================

/// Everything needed to run one execution step on one device.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: Uuid,
    pub udid: String,
    pub hash: String,
    pub xctestrun: PathBuf,
    pub test_configuration: String,
    pub step: ExecutionStep,
    /// `<output_dir>/<hash>.xcresult`
    pub result_bundle: PathBuf,
    /// `<output_dir>/<hash>.trace`
    pub trace: PathBuf,
}

impl StepContext {
    fn new(
        session_id: Uuid,
        udid: &str,
        plan: &SessionTestPlan,
        output_dir: &Path,
        hash: String,
        step: ExecutionStep,
    ) -> Self {
        Self {
            session_id,
            udid: udid.to_string(),
            xctestrun: plan.xctestrun_config.path.clone(),
            test_configuration: plan.xctestrun_config.test_configuration.clone(),
            result_bundle: output_dir.join(format!("{hash}.xcresult")),
            trace: output_dir.join(format!("{hash}.trace")),
            hash,
            step,
        }
    }
}

/// Runs a single execution step. An `Err` marks the step failed.
#[async_trait]
pub trait StepRunner: Send + Sync + 'static {
    async fn run_step(&self, ctx: &StepContext) -> anyhow::Result<()>;
}

/// Runs steps with `xcodebuild test-without-building` and reads the verdict
/// from the result bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct XcodebuildStepRunner;

impl XcodebuildStepRunner {
    pub fn command(ctx: &StepContext) -> XcodebuildTestCommand {
        let mut command =
            XcodebuildTestCommand::new(&ctx.xctestrun, Destination::ios(&ctx.udid));
        command.test_configuration = Some(ctx.test_configuration.clone());
        command.result_bundle_path = Some(ctx.result_bundle.clone());
        command.only_testing = ctx.step.only_testing();
        command
    }
}

#[async_trait]
impl StepRunner for XcodebuildStepRunner {
    async fn run_step(&self, ctx: &StepContext) -> anyhow::Result<()> {
        if let Some(parent) = ctx.result_bundle.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Failing tests also exit non-zero; the bundle then holds the details.
        if let Err(e) = Xcodebuild::run(Self::command(ctx), None).await {
            let bundle_written = tokio::fs::try_exists(&ctx.result_bundle)
                .await
                .unwrap_or(false);
            match e {
                XcodebuildError::Failed { return_code, .. } if bundle_written => {
                    tracing::warn!(hash = %ctx.hash, return_code, "xcodebuild reported failures");
                }
                e => return Err(e.into()),
            }
        }

        let summary = XcresultTool::new(&ctx.result_bundle).summary().await?;
        tracing::info!(
            hash = %ctx.hash,
            result = %summary.result,
            passed = summary.passed_tests,
            failed = summary.failed_tests,
            "Step finished"
        );
        if !summary.passed() {
            anyhow::bail!(
                "{} of {} tests failed",
                summary.failed_tests,
                summary.total_test_count
            );
        }
        Ok(())
    }
}

// ============================================================================
// Lab
// ============================================================================

/// A submitted session run.
#[derive(Debug, Clone)]
pub struct SessionRun {
    pub session_id: Uuid,
    pub job: JobHandle,
    pub state: Arc<RwLock<SessionState>>,
}

/// Owns the device manager, tunnel manager, job runner and blocking pool.
pub struct DeviceLab {
    config: LabConfig,
    pool: BlockingPool,
    devices: DeviceManager,
    tunnels: Arc<TunnelManager>,
    jobs: JobRunner,
    runner: Arc<dyn StepRunner>,
}

impl DeviceLab {
    pub fn new(config: LabConfig, discovery: Arc<dyn DeviceDiscovery>) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = BlockingPool::new(config.blocking_pool_size);
        Ok(Self {
            devices: DeviceManager::new(discovery, pool.clone()),
            tunnels: Arc::new(TunnelManager::new(config.tunnel.clone())),
            jobs: JobRunner::new(),
            runner: Arc::new(XcodebuildStepRunner),
            pool,
            config,
        })
    }

    /// Replace the step runner used by session jobs.
    pub fn with_step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    pub fn pool(&self) -> &BlockingPool {
        &self.pool
    }

    /// Start the tunnel server.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.tunnels.start().await?;
        Ok(())
    }

    /// Job id of the session run on `udid`. At most one runs per device.
    pub fn session_job_id(udid: &str) -> String {
        format!("session:{udid}")
    }

    pub fn teardown_job_id(udid: &str) -> String {
        format!("tunnel-teardown:{udid}")
    }

    /// Plan `test_plan` and run it on `udid` in the background.
    ///
    /// # Errors
    ///
    /// Fails before anything runs if the plan is invalid, the device is
    /// unknown, or a session is already running on the device.
    pub async fn submit_session(
        &self,
        udid: &str,
        test_plan: SessionTestPlan,
    ) -> Result<SessionRun, CoreError> {
        let plan = ExecutionPlan::from_test_plan(test_plan)?;
        let device = self.devices.get_device(udid).await?;

        let session_id = Uuid::new_v4();
        let test_plan = plan.test_plan.clone();
        let state = Arc::new(RwLock::new(SessionState::new(session_id, plan)));

        let work = run_session(
            device,
            Arc::clone(&self.tunnels),
            test_plan,
            Arc::clone(&state),
            self.config.output_dir.clone(),
            Arc::clone(&self.runner),
        );
        let job = self.jobs.submit(Self::session_job_id(udid), work).await?;

        tracing::info!(%session_id, udid, "Session submitted");
        Ok(SessionRun {
            session_id,
            job,
            state,
        })
    }

    /// Close the tunnel to `udid` in the background.
    pub async fn submit_tunnel_teardown(&self, udid: &str) -> Result<JobHandle, CoreError> {
        let device = self.devices.get_device(udid).await?;
        let tunnels = Arc::clone(&self.tunnels);
        let work = async move {
            tunnels.close_tunnel(device.udid()).await?;
            device.clear_tunnel().await;
            Ok(())
        };
        Ok(self.jobs.submit(Self::teardown_job_id(udid), work).await?)
    }

    /// Abort all jobs, stop the tunnel server and close the blocking pool.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.jobs.shutdown().await;
        let stopped = if self.tunnels.is_running().await {
            self.tunnels.stop().await.map_err(CoreError::from)
        } else {
            Ok(())
        };
        self.pool.shutdown();
        tracing::info!("Device lab shut down");
        stopped
    }
}

async fn run_session(
    device: Arc<Device>,
    tunnels: Arc<TunnelManager>,
    test_plan: SessionTestPlan,
    state: Arc<RwLock<SessionState>>,
    output_dir: PathBuf,
    runner: Arc<dyn StepRunner>,
) -> anyhow::Result<()> {
    let session_id = state.read().await.session_id;
    device.check_paired().await?;
    if device.requires_tunnel().await? {
        device.establish_trusted_channel(&tunnels).await?;
    }

    loop {
        let (index, ctx) = {
            let mut state = state.write().await;
            let Some(index) = state.next_execution_step() else {
                break;
            };
            let Some(step_state) = state.step_mut(index) else {
                break;
            };
            step_state.set_running();
            let ctx = StepContext::new(
                session_id,
                device.udid(),
                &test_plan,
                &output_dir,
                step_state.hash.clone(),
                step_state.step.clone(),
            );
            (index, ctx)
        };

        tracing::info!(
            %session_id,
            hash = %ctx.hash,
            order = ctx.step.order(),
            plan_repetition = ctx.step.plan_repetition,
            step_repetition = ctx.step.step_repetition,
            "Running step"
        );
        let result = runner.run_step(&ctx).await;

        let mut state = state.write().await;
        if let Some(step_state) = state.step_mut(index) {
            match result {
                Ok(()) => step_state.set_completed(),
                Err(e) => {
                    tracing::warn!(%session_id, hash = %ctx.hash, error = format!("{e:#}"), "Step failed");
                    step_state.set_failed(format!("{e:#}"));
                }
            }
        }
    }

    let state = state.read().await;
    let (completed, failed, skipped) = state.counts();
    tracing::info!(%session_id, completed, failed, skipped, "Session finished");
    if failed > 0 {
        anyhow::bail!("{failed} of {} steps failed", state.steps.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::{FakeDevice, FakeDiscovery};
    use crate::execution::{
        Metric, PlanStep, RecordingStartStrategy, RecordingStrategy, RepetitionStrategy,
        StepStatus, StepTestCase, XctestrunConfig,
    };
    use crate::config::TunnelManagerConfig;
    use crate::jobs::JobState;
    use crate::process::ProcessCommand;
    use std::sync::Mutex;

    /// Records each step and fails the ones whose order is listed.
    #[derive(Default)]
    struct RecordingRunner {
        seen: Mutex<Vec<StepContext>>,
        fail_orders: Vec<u32>,
    }

    #[async_trait]
    impl StepRunner for RecordingRunner {
        async fn run_step(&self, ctx: &StepContext) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(ctx.clone());
            if self.fail_orders.contains(&ctx.step.order()) {
                anyhow::bail!("step {} failed", ctx.step.order());
            }
            Ok(())
        }
    }

    fn test_plan(steps: u32, end_on_failure: bool) -> SessionTestPlan {
        SessionTestPlan {
            name: Some("lab".into()),
            xctestrun_config: XctestrunConfig {
                path: "App.xctestrun".into(),
                test_configuration: "Default".into(),
            },
            end_on_failure,
            repetitions: 1,
            repetition_strategy: RepetitionStrategy::EntireSuite,
            metrics: vec![Metric::Cpu],
            recording_strategy: RecordingStrategy::PerStep,
            recording_start_strategy: RecordingStartStrategy::Launch,
            reinstall_app: false,
            steps: (0..steps)
                .map(|order| PlanStep::new(order, vec![StepTestCase::new("UITests/LoginTests/testLogin")]))
                .collect(),
        }
    }

    fn lab(runner: Arc<RecordingRunner>) -> DeviceLab {
        let discovery = Arc::new(FakeDiscovery::default());
        discovery.connect(FakeDevice::new("dev-1", "16.4"));
        let tunnel = TunnelManagerConfig::builder()
            .provider(["tunnel", "{udid}"])
            .build()
            .unwrap();
        let config = LabConfig::builder()
            .output_dir("/tmp/devicelab-out")
            .tunnel(tunnel)
            .build()
            .unwrap();
        DeviceLab::new(config, discovery).unwrap().with_step_runner(runner)
    }

    #[tokio::test]
    async fn test_session_runs_every_step() {
        let runner = Arc::new(RecordingRunner::default());
        let lab = lab(Arc::clone(&runner));

        let mut run = lab.submit_session("dev-1", test_plan(3, false)).await.unwrap();
        assert!(matches!(run.job.wait().await, JobState::Succeeded));

        let seen = runner.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        for ctx in &seen {
            assert_eq!(ctx.session_id, run.session_id);
            assert_eq!(
                ctx.result_bundle,
                PathBuf::from(format!("/tmp/devicelab-out/{}.xcresult", ctx.hash))
            );
            assert_eq!(ctx.trace.extension().unwrap(), "trace");
        }
        let state = run.state.read().await;
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_end_on_failure_skips_remaining_steps() {
        let runner = Arc::new(RecordingRunner {
            fail_orders: vec![1],
            ..Default::default()
        });
        let lab = lab(Arc::clone(&runner));

        let mut run = lab.submit_session("dev-1", test_plan(4, true)).await.unwrap();
        match run.job.wait().await {
            JobState::Failed(e) => assert!(e.to_string().contains("1 of 4 steps failed")),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(runner.seen.lock().unwrap().len(), 2);
        assert_eq!(run.state.read().await.counts(), (1, 1, 2));
    }

    #[tokio::test]
    async fn test_failures_without_end_on_failure_run_everything() {
        let runner = Arc::new(RecordingRunner {
            fail_orders: vec![0],
            ..Default::default()
        });
        let lab = lab(Arc::clone(&runner));

        let mut run = lab.submit_session("dev-1", test_plan(3, false)).await.unwrap();
        assert!(matches!(run.job.wait().await, JobState::Failed(_)));
        assert_eq!(runner.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_device_and_bad_plan() {
        let lab = lab(Arc::new(RecordingRunner::default()));

        assert!(matches!(
            lab.submit_session("nope", test_plan(1, false)).await,
            Err(CoreError::Device(_))
        ));
        assert!(matches!(
            lab.submit_session("dev-1", test_plan(0, false)).await,
            Err(CoreError::Plan(_))
        ));
    }

    #[test]
    fn test_xcodebuild_step_command() {
        let ctx = StepContext::new(
            Uuid::nil(),
            "dev-1",
            &test_plan(1, false),
            Path::new("out"),
            "abc".into(),
            ExecutionPlan::from_test_plan(test_plan(1, false))
                .unwrap()
                .execution_steps
                .remove(0),
        );
        let args = XcodebuildStepRunner::command(&ctx).parse();

        assert_eq!(args[0], "xcodebuild");
        assert!(args.contains(&"test-without-building".to_string()));
        assert!(args.contains(&"out/abc.xcresult".to_string()));
        let only = args.iter().position(|a| a == "-only-testing").unwrap();
        assert_eq!(args[only + 1], "UITests/LoginTests/testLogin");
        let destination = args.iter().position(|a| a == "-destination").unwrap();
        assert_eq!(args[destination + 1], "platform=iOS,id=dev-1");
    }
}
