//! Supervision of external command invocations.
//!
//! A [`Process`] owns one child process from launch until it has been reaped.
//! Both output streams are drained by background tasks as soon as the child
//! starts, so a chatty child never blocks on a full pipe, and a dedicated
//! waiter task reaps the child whether or not anyone calls [`Process::wait`].
//!
//! Captured output is unbounded by default. Long-lived children should set
//! [`Process::with_capture_limit`] so only the most recent lines are kept.
//!
//! Dropping a running `Process` sends it `SIGKILL`; the waiter task then
//! reaps it. If the runtime itself is torn down, `kill_on_drop` covers the
//! same ground.

use crate::error::ProcessError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Translates a typed intent into an argument vector.
///
/// Implementations are pure: building the same command twice yields the
/// same vector and performs no I/O.
pub trait ProcessCommand: Send + Sync {
    /// Program followed by its arguments.
    fn parse(&self) -> Vec<String>;
}

impl ProcessCommand for Vec<String> {
    fn parse(&self) -> Vec<String> {
        self.clone()
    }
}

/// Captured output of a finished process, one entry per line, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A supervised external command.
pub struct Process {
    command: Box<dyn ProcessCommand>,
    run: Option<Run>,
    stdout_tap: Option<mpsc::UnboundedSender<String>>,
    capture_limit: Option<usize>,
}

/// State of one launch.
struct Run {
    pid: Option<u32>,
    exit: watch::Receiver<Option<i32>>,
    stdout: Capture,
    stderr: Capture,
}

enum Capture {
    Reading(JoinHandle<Vec<String>>),
    Done(Vec<String>),
}

impl Capture {
    /// Resolve the reader task. Safe to call again if a previous call was cancelled.
    async fn finish(&mut self) -> Vec<String> {
        if let Self::Reading(handle) = self {
            let lines = match handle.await {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(error = %e, "Output reader task failed");
                    Vec::new()
                }
            };
            *self = Self::Done(lines);
        }
        match self {
            Self::Done(lines) => lines.clone(),
            Self::Reading(_) => Vec::new(),
        }
    }
}

impl Process {
    pub fn new(command: impl ProcessCommand + 'static) -> Self {
        Self {
            command: Box::new(command),
            run: None,
            stdout_tap: None,
            capture_limit: None,
        }
    }

    /// Keep at most the last `lines` lines of each stream.
    pub fn with_capture_limit(mut self, lines: usize) -> Self {
        self.capture_limit = Some(lines);
        self
    }

    /// The argument vector this process runs.
    pub fn args(&self) -> Vec<String> {
        self.command.parse()
    }

    /// Receive stdout lines as they are written, in addition to the capture
    /// returned by [`wait`](Self::wait).
    ///
    /// Applies to the next `execute` only. The channel closes when the
    /// process closes its stdout.
    pub fn subscribe_stdout(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stdout_tap = Some(tx);
        rx
    }

    /// Launch the command.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::AlreadyRunning`] if a previous launch has not exited.
    /// - [`ProcessError::Spawn`] if the executable cannot be started.
    pub async fn execute(&mut self, cwd: Option<&Path>) -> Result<(), ProcessError> {
        if self.is_running() {
            return Err(ProcessError::AlreadyRunning);
        }

        let args = self.command.parse();
        let (program, rest) = args.split_first().ok_or(ProcessError::EmptyCommand)?;
        tracing::info!(command = %args.join(" "), "Executing command");

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| {
            tracing::error!(program = %program, error = %source, "Failed to spawn process");
            ProcessError::Spawn {
                program: program.clone(),
                source,
            }
        })?;
        let pid = child.id();
        tracing::debug!(pid, program = %program, "Process started");

        let stdout = match child.stdout.take() {
            Some(out) => Capture::Reading(tokio::spawn(read_lines(
                out,
                self.stdout_tap.take(),
                self.capture_limit,
            ))),
            None => Capture::Done(Vec::new()),
        };
        let stderr = match child.stderr.take() {
            Some(err) => Capture::Reading(tokio::spawn(read_lines(err, None, self.capture_limit))),
            None => Capture::Done(Vec::new()),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let started = Instant::now();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to reap process");
                    -1
                }
            };
            tracing::debug!(
                pid,
                code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Process exited"
            );
            let _ = exit_tx.send(Some(code));
        });

        self.run = Some(Run {
            pid,
            exit: exit_rx,
            stdout,
            stderr,
        });
        Ok(())
    }

    /// Wait for the process to exit and return everything it wrote.
    ///
    /// Returns empty output if the process was never launched. Calling again
    /// after exit returns the same capture.
    pub async fn wait(&mut self) -> Result<ProcessOutput, ProcessError> {
        let Some(run) = self.run.as_mut() else {
            return Ok(ProcessOutput::default());
        };

        let stdout = run.stdout.finish().await;
        let stderr = run.stderr.finish().await;

        let mut exit = run.exit.clone();
        exit.wait_for(Option::is_some).await.map_err(|_| {
            std::io::Error::other("process supervisor task ended before the process exited")
        })?;

        Ok(ProcessOutput { stdout, stderr })
    }

    /// Ask the process to exit with `SIGTERM`. Does nothing once exited.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Force the process to exit with `SIGKILL`. Does nothing once exited.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.send_signal(Signal::SIGKILL)
    }

    pub fn send_signal(&self, sig: Signal) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }
        let Some(pid) = self.run.as_ref().and_then(|r| r.pid) else {
            return Ok(());
        };
        tracing::debug!(pid, signal = ?sig, "Sending signal to process");
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            // Exited between the check and the signal.
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Exit code of the process.
    ///
    /// A process killed by a signal reports the negated signal number.
    pub fn returncode(&self) -> Result<i32, ProcessError> {
        let run = self.run.as_ref().ok_or(ProcessError::NotStarted)?;
        let code = *run.exit.borrow();
        code.ok_or(ProcessError::NotExited)
    }

    pub fn pid(&self) -> Option<u32> {
        self.run.as_ref().and_then(|r| r.pid)
    }

    /// Launched and not yet exited.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.exit.borrow().is_none())
    }

    /// Launched and exited.
    pub fn terminated(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.exit.borrow().is_some())
    }

    /// Exited with a non-zero code.
    pub fn failed(&self) -> bool {
        matches!(self.returncode(), Ok(code) if code != 0)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::debug!(pid = self.pid(), "Killing process on drop");
            if let Err(e) = self.kill() {
                tracing::warn!(error = %e, "Failed to kill process on drop");
            }
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("args", &self.command.parse())
            .field("pid", &self.pid())
            .field("running", &self.is_running())
            .finish()
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => -sig,
        (None, None) => -1,
    }
}

async fn read_lines<R>(
    stream: R,
    mut tap: Option<mpsc::UnboundedSender<String>>,
    limit: Option<usize>,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut lines = VecDeque::new();
    let mut dropped = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']).to_string();
                tracing::trace!(line = %line, "Read process output line");
                if let Some(sender) = &tap {
                    if sender.send(line.clone()).is_err() {
                        // Subscriber went away.
                        tap = None;
                    }
                }
                lines.push_back(line);
                if limit.is_some_and(|max| lines.len() > max) {
                    lines.pop_front();
                    dropped += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
    if dropped > 0 {
        tracing::debug!(dropped, kept = lines.len(), "Discarded older process output");
    }
    lines.into()
}

/// Run a command to completion.
///
/// # Errors
///
/// Returns [`ProcessError::Failed`] with the captured output if the process
/// exits with a non-zero code.
pub async fn run_process(
    command: impl ProcessCommand + 'static,
    cwd: Option<&Path>,
) -> Result<ProcessOutput, ProcessError> {
    let mut process = Process::new(command);
    process.execute(cwd).await?;
    let output = process.wait().await?;
    let return_code = process.returncode()?;
    if return_code != 0 {
        return Err(ProcessError::Failed {
            stdout: output.stdout,
            stderr: output.stderr,
            return_code,
        });
    }
    Ok(output)
}
