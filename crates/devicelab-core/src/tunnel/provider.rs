//! Tunnel provider backed by an external command.
//!
//! One provider process runs per device. Its first non-empty stdout line must
//! be a JSON [`TunnelEndpoint`]; the process is kept running for as long as
//! the tunnel is live and is terminated on close.
//!
//! Exit codes reported before an endpoint was printed:
//!
//! | code | meaning                 |
//! |------|-------------------------|
//! | 100  | device not found        |
//! | 101  | no device connected     |
//! | else | generic provider error  |

use super::protocol::TunnelEndpoint;
use super::server::TunnelProvider;
use crate::error::TunnelError;
use crate::process::Process;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Placeholder replaced by the device udid in the command template.
pub const UDID_PLACEHOLDER: &str = "{udid}";

pub const EXIT_DEVICE_NOT_FOUND: i32 = 100;
pub const EXIT_NO_DEVICE_CONNECTED: i32 = 101;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Lines of provider output kept per stream for error reports.
const OUTPUT_TAIL_LINES: usize = 200;

pub struct CommandTunnelProvider {
    template: Vec<String>,
    startup_timeout: Duration,
    stop_timeout: Duration,
    processes: Mutex<HashMap<String, Process>>,
}

impl CommandTunnelProvider {
    pub fn new(template: Vec<String>) -> Self {
        Self {
            template,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// The command run for `udid`.
    pub fn command_for(&self, udid: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| arg.replace(UDID_PLACEHOLDER, udid))
            .collect()
    }

    /// Number of provider processes currently held.
    pub async fn active(&self) -> usize {
        self.processes.lock().await.len()
    }

    async fn read_endpoint(
        &self,
        udid: &str,
        process: &mut Process,
        mut lines: tokio::sync::mpsc::UnboundedReceiver<String>,
    ) -> Result<TunnelEndpoint, TunnelError> {
        let first_line = async {
            while let Some(line) = lines.recv().await {
                if !line.trim().is_empty() {
                    return Some(line);
                }
            }
            None
        };

        let line = match timeout(self.startup_timeout, first_line).await {
            Ok(Some(line)) => line,
            // stdout closed before anything was printed
            Ok(None) => {
                let output = process.wait().await?;
                let code = process.returncode()?;
                tracing::warn!(udid = %udid, code, "Tunnel provider exited without an endpoint");
                return Err(match code {
                    EXIT_DEVICE_NOT_FOUND => TunnelError::DeviceNotFound {
                        udid: udid.to_string(),
                    },
                    EXIT_NO_DEVICE_CONNECTED => TunnelError::NoDeviceConnected,
                    _ => TunnelError::Provider(format!(
                        "provider exited with code {code}: {}",
                        output.stderr.join("\n")
                    )),
                });
            }
            Err(_) => {
                return Err(TunnelError::Provider(format!(
                    "provider printed no endpoint within {:?}",
                    self.startup_timeout
                )));
            }
        };

        tracing::trace!(udid = %udid, line = %line, "Tunnel provider output");
        serde_json::from_str(line.trim())
            .map_err(|e| TunnelError::Provider(format!("invalid endpoint {line:?}: {e}")))
    }

    async fn shutdown(&self, udid: &str, mut process: Process) -> Result<(), TunnelError> {
        process.terminate()?;
        if timeout(self.stop_timeout, process.wait()).await.is_err() {
            tracing::warn!(udid = %udid, "Tunnel provider ignored SIGTERM, killing");
            process.kill()?;
            process.wait().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelProvider for CommandTunnelProvider {
    async fn open(&self, udid: &str) -> Result<TunnelEndpoint, TunnelError> {
        let mut process =
            Process::new(self.command_for(udid)).with_capture_limit(OUTPUT_TAIL_LINES);
        let lines = process.subscribe_stdout();
        process.execute(None).await?;

        match self.read_endpoint(udid, &mut process, lines).await {
            Ok(endpoint) => {
                tracing::debug!(udid = %udid, pid = process.pid(), "Tunnel provider ready");
                self.processes.lock().await.insert(udid.to_string(), process);
                Ok(endpoint)
            }
            Err(e) => {
                if process.is_running() {
                    if let Err(stop_err) = self.shutdown(udid, process).await {
                        tracing::warn!(udid = %udid, error = %stop_err, "Failed to stop tunnel provider");
                    }
                }
                Err(e)
            }
        }
    }

    async fn close(&self, udid: &str) -> Result<(), TunnelError> {
        let Some(process) = self.processes.lock().await.remove(udid) else {
            return Ok(());
        };
        self.shutdown(udid, process).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandTunnelProvider {
        CommandTunnelProvider::new(vec!["sh".into(), "-c".into(), script.into()])
            .with_startup_timeout(Duration::from_secs(5))
            .with_stop_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_command_substitutes_udid() {
        let provider = CommandTunnelProvider::new(vec![
            "tunnel".into(),
            "--udid={udid}".into(),
            "{udid}".into(),
        ]);
        assert_eq!(
            provider.command_for("abc"),
            vec!["tunnel", "--udid=abc", "abc"]
        );
    }

    #[tokio::test]
    async fn test_open_reads_endpoint_and_close_stops_process() {
        let provider = sh(r#"echo; echo '{"address":"127.0.0.1","port":5000}'; exec sleep 60"#);
        let endpoint = provider.open("dev").await.unwrap();
        assert_eq!(endpoint.port, 5000);
        assert_eq!(provider.active().await, 1);

        provider.close("dev").await.unwrap();
        assert_eq!(provider.active().await, 0);
        // Closing again is a no-op.
        provider.close("dev").await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_errors() {
        let result = sh("exit 100").open("dev").await;
        assert!(matches!(result, Err(TunnelError::DeviceNotFound { udid }) if udid == "dev"));

        let result = sh("exit 101").open("dev").await;
        assert!(matches!(result, Err(TunnelError::NoDeviceConnected)));

        let result = sh("echo boom >&2; exit 3").open("dev").await;
        assert!(matches!(result, Err(TunnelError::Provider(m)) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_garbage_endpoint_is_rejected() {
        let provider = sh("echo not-json; exec sleep 60");
        let result = provider.open("dev").await;
        assert!(matches!(result, Err(TunnelError::Provider(_))));
        assert_eq!(provider.active().await, 0);
    }

    #[tokio::test]
    async fn test_provider_error_reports_output_tail() {
        let result = sh("seq 1 1000 >&2; exit 3").open("dev").await;
        match result {
            Err(TunnelError::Provider(message)) => {
                assert!(message.contains(": 801\n"), "{message}");
                assert!(message.ends_with("\n1000"));
                assert_eq!(message.lines().count(), OUTPUT_TAIL_LINES);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
