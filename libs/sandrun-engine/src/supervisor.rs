/// Process Supervisor
///
/// Runs one command to completion under a wall-clock deadline:
/// - stdout/stderr are drained incrementally by reader tasks into buffers
///   shared with the supervisor, each capped at `output_limit` bytes
/// - the deadline timer is armed before the spawn and raced against the exit
/// - the child leads its own process group; on timeout and after exit the
///   whole group is SIGKILLed, so background descendants never outlive the job
/// - the child is killed on drop, so cancelling the call never leaks it
///
/// No retries; that policy belongs to the caller.

use sandrun_common::languages::ResolvedCommand;
use sandrun_common::{ExecutionError, Phase};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long reader tasks may lag behind process exit
const READER_GRACE: Duration = Duration::from_secs(1);
const CHUNK_SIZE: usize = 8 * 1024;

/// Captured output, trimmed of surrounding whitespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Either stream exceeded the capture ceiling
    pub truncated: bool,
}

/// Discriminated result of one supervised run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success(CapturedOutput),
    NonZeroExit {
        /// `None` when the process was terminated by a signal
        code: Option<i32>,
        output: CapturedOutput,
    },
    Timeout {
        after: Duration,
    },
    LaunchError {
        program: String,
        message: String,
    },
}

impl ProcessOutcome {
    /// Map onto the error taxonomy for the given phase
    pub fn into_result(self, phase: Phase) -> Result<CapturedOutput, ExecutionError> {
        match self {
            ProcessOutcome::Success(output) => Ok(output),
            ProcessOutcome::NonZeroExit { code, output } => {
                let message = if !output.stderr.is_empty() {
                    output.stderr
                } else {
                    match code {
                        Some(code) => format!("Command failed with exit code {}", code),
                        None => "Command terminated by signal".to_string(),
                    }
                };
                Err(match phase {
                    Phase::Compile => ExecutionError::Compile(message),
                    Phase::Execute => ExecutionError::Runtime(message),
                })
            }
            ProcessOutcome::Timeout { after } => Err(ExecutionError::Timeout {
                phase,
                timeout_ms: after.as_millis() as u64,
            }),
            ProcessOutcome::LaunchError { program, message } => {
                Err(ExecutionError::Launch { program, message })
            }
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_text(self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

type SharedCapture = Arc<Mutex<Captured>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Captured> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize, sink: SharedCapture) {
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                // Keep draining past the limit so the child never blocks on a full pipe
                let mut captured = lock(&sink);
                let room = limit.saturating_sub(captured.bytes.len());
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
                if n > room {
                    captured.truncated = true;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

/// Reader task plus the buffer it fills; the buffer survives an abort
struct StreamReader {
    handle: JoinHandle<()>,
    sink: SharedCapture,
}

impl StreamReader {
    fn spawn<R>(stream: Option<R>, limit: usize) -> Option<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        stream.map(|stream| {
            let sink = SharedCapture::default();
            let handle = tokio::spawn(capture(stream, limit, Arc::clone(&sink)));
            Self { handle, sink }
        })
    }

    fn abort(self) {
        self.handle.abort();
    }

    /// Wait for the stream to close, then hand over whatever was read
    async fn finish(mut self) -> Captured {
        match tokio::time::timeout(READER_GRACE, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Output reader task failed"),
            Err(_) => {
                // Something outside our process group still holds the pipe
                self.handle.abort();
                warn!("Output reader did not finish after process exit");
            }
        }
        std::mem::take(&mut *lock(&self.sink))
    }
}

async fn finish_reader(reader: Option<StreamReader>) -> Captured {
    match reader {
        Some(reader) => reader.finish().await,
        None => Captured::default(),
    }
}

fn abort_reader(reader: Option<StreamReader>) {
    if let Some(reader) = reader {
        reader.abort();
    }
}

/// SIGKILL every process in the group led by `pgid`
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        // SAFETY: killpg only sends a signal; ESRCH for an empty group is ignored
        unsafe {
            libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

/// Kills the child's process group once; also on drop, so a cancelled run
/// takes its descendants with it
struct GroupKill(Option<u32>);

impl GroupKill {
    fn fire(&mut self) {
        kill_process_group(self.0.take());
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.fire();
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    output_limit: usize,
}

impl ProcessSupervisor {
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }

    /// Run `command` until it exits or its deadline fires
    pub async fn run(&self, command: &ResolvedCommand) -> ProcessOutcome {
        let deadline = tokio::time::sleep(command.timeout);
        tokio::pin!(deadline);

        debug!(
            command = %command.display(),
            timeout_ms = command.timeout.as_millis() as u64,
            "Spawning process"
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutcome::LaunchError {
                    program: command.program.clone(),
                    message: e.to_string(),
                }
            }
        };

        // The id is gone once the child is reaped, so keep it for the group kill
        let mut group = GroupKill(child.id());
        let stdout = StreamReader::spawn(child.stdout.take(), self.output_limit);
        let stderr = StreamReader::spawn(child.stderr.take(), self.output_limit);

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut deadline => None,
        };

        match status {
            None => {
                group.fire();
                // start_kill + wait: SIGKILL, then reap
                if let Err(e) = child.kill().await {
                    warn!(program = %command.program, error = %e, "Failed to kill timed-out process");
                }
                abort_reader(stdout);
                abort_reader(stderr);
                debug!(program = %command.program, "Process killed after deadline");
                ProcessOutcome::Timeout {
                    after: command.timeout,
                }
            }
            Some(Err(e)) => {
                group.fire();
                let _ = child.kill().await;
                abort_reader(stdout);
                abort_reader(stderr);
                ProcessOutcome::LaunchError {
                    program: command.program.clone(),
                    message: format!("failed to wait for process: {}", e),
                }
            }
            Some(Ok(status)) => {
                // Descendants left behind would hold the pipes open
                group.fire();
                let out = finish_reader(stdout).await;
                let err = finish_reader(stderr).await;
                let output = CapturedOutput {
                    truncated: out.truncated || err.truncated,
                    stdout: out.into_text(),
                    stderr: err.into_text(),
                };

                if status.success() {
                    ProcessOutcome::Success(output)
                } else {
                    ProcessOutcome::NonZeroExit {
                        code: status.code(),
                        output,
                    }
                }
            }
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}
