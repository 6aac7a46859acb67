//! Helper launch protocol: spawn → bounded wait → classify → report.
//!
//! Every helper launch goes through [`run`]. Output capture is chosen per
//! call: short-lived tools whose output the caller consumes synchronously
//! use pipes, backgrounding servers write to a persisted log file that
//! survives for post-mortem reads. Forking helpers leave their real PID in
//! a pid-file; when the caller asks for it, that PID overrides the one of
//! the (already exited) process we spawned.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::command::HelperCommand;
use super::error::SupervisorError;
use crate::process_monitor;

/// How a launch captures the helper's stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Both streams to pipes, drained once the helper exits.
    Pipe,
    /// Both streams to a fresh temp log file, kept on disk after the call.
    LogFile,
}

/// One launch attempt: argument vector plus launch options. Ephemeral,
/// consumed by [`run`].
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub command: HelperCommand,
    pub capture: CaptureMode,
    /// Poll this file for the real PID of a helper that forks away.
    pub pid_file: Option<PathBuf>,
}

impl LaunchRequest {
    /// Pipe-capture launch, for tools expected to terminate quickly.
    pub fn piped(command: HelperCommand) -> Self {
        Self {
            command,
            capture: CaptureMode::Pipe,
            pid_file: None,
        }
    }

    /// File-capture launch, the default for backgrounding servers.
    pub fn logged(command: HelperCommand) -> Self {
        Self {
            command,
            capture: CaptureMode::LogFile,
            pid_file: None,
        }
    }

    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }
}

/// Result of a successful launch. Exactly one of `log_path` or the
/// `stdout`/`stderr` pair is set, depending on the requested capture mode.
/// Owns no reference to the OS process — supervision ends here, the helper
/// keeps running on its own.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// Resolved PID of the effective process, not necessarily the one the
    /// spawn call returned.
    pub pid: u32,
    pub log_path: Option<PathBuf>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Execute the launch protocol for one helper.
pub(crate) async fn run(
    request: LaunchRequest,
    wait_timeout: Duration,
) -> Result<ProcessHandle, SupervisorError> {
    let program = request.command.program.clone();
    tracing::debug!("CMD: {}", request.command);

    let mut cmd = Command::new(&program);
    cmd.args(&request.command.args).stdin(Stdio::null());

    let log_path = match request.capture {
        CaptureMode::Pipe => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        }
        CaptureMode::LogFile => Some(create_log_file(&program, &mut cmd)?),
    };

    let mut child = cmd
        .spawn()
        .map_err(|e| SupervisorError::process(&program, format!("spawn failed: {}", e)))?;
    let spawned_pid = child
        .id()
        .ok_or_else(|| SupervisorError::process(&program, "spawned process has no pid"))?;

    // Drain the pipes from their own tasks before waiting, so a chatty
    // helper can never stall on a full pipe buffer.
    let stdout_task = child.stdout.take().map(read_stream);
    let stderr_task = child.stderr.take().map(read_stream);

    let exit = match tokio::time::timeout(wait_timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(SupervisorError::process(
                &program,
                format!("wait failed: {}", e),
            ));
        }
        Err(_) => {
            // 타임아웃 — 종료도 fork도 하지 않은 프로세스는 강제 종료
            tracing::warn!(
                "[{}] did not exit or background within {}s, killing",
                program,
                wait_timeout.as_secs()
            );
            let _ = child.kill().await;
            return Err(SupervisorError::process(
                &program,
                format!(
                    "did not exit or background within {}s",
                    wait_timeout.as_secs()
                ),
            ));
        }
    };
    tracing::debug!("Return code: {:?}", exit.code());

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    if !exit.success() {
        tracing::info!("CMD: {}", request.command);
        let diagnostic = match request.capture {
            CaptureMode::Pipe => {
                // stderr first; some tools report their failure on stdout
                if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                }
            }
            CaptureMode::LogFile => match &log_path {
                Some(path) => read_log(path, &program)?,
                None => String::new(),
            },
        };
        return Err(SupervisorError::process(&program, diagnostic));
    }

    let pid = match &request.pid_file {
        Some(path) => {
            let real_pid = read_pid_file(path, &program)?;
            if real_pid != spawned_pid {
                tracing::debug!(
                    "[{}] backgrounded, pid {} resolved from {}",
                    program,
                    real_pid,
                    path.display()
                );
            }
            if !process_monitor::is_running_async(real_pid).await {
                // 정보성 경고 — 핸들 반환은 그대로 진행
                tracing::warn!(
                    "[{}] pid {} from {} is not visible in the process table",
                    program,
                    real_pid,
                    path.display()
                );
            }
            real_pid
        }
        None => spawned_pid,
    };

    let handle = match request.capture {
        CaptureMode::Pipe => ProcessHandle {
            pid,
            log_path: None,
            stdout: Some(stdout.trim().to_string()),
            stderr: Some(stderr.trim().to_string()),
        },
        CaptureMode::LogFile => ProcessHandle {
            pid,
            log_path,
            stdout: None,
            stderr: None,
        },
    };
    tracing::debug!("Started [{}] process, pid {}", program, handle.pid);
    Ok(handle)
}

/// Create the persisted temp log file and wire both child streams into it.
/// The file is kept on disk on purpose; cleanup belongs to the caller or
/// the OS, the path stays visible through the returned handle.
fn create_log_file(program: &str, cmd: &mut Command) -> Result<PathBuf, SupervisorError> {
    let logfile = tempfile::Builder::new()
        .prefix(program)
        .suffix(".log")
        .tempfile()
        .map_err(|e| SupervisorError::process(program, format!("unable to create log file: {}", e)))?;
    let (file, path) = logfile
        .keep()
        .map_err(|e| SupervisorError::process(program, format!("unable to keep log file: {}", e)))?;
    let stdout_file = file
        .try_clone()
        .map_err(|e| SupervisorError::process(program, format!("unable to clone log handle: {}", e)))?;
    cmd.stdout(Stdio::from(stdout_file)).stderr(Stdio::from(file));
    Ok(path)
}

/// Allocate a unique pid-file for a helper that runs until explicitly
/// terminated (the nbdkit plugin host). Kept on disk like the log files.
pub(crate) fn allocate_pid_file() -> Result<PathBuf, SupervisorError> {
    let pidfile = tempfile::Builder::new()
        .prefix("nbdkit")
        .suffix(".pid")
        .tempfile()
        .map_err(|e| SupervisorError::process("nbdkit", format!("unable to create pid file: {}", e)))?;
    let (_, path) = pidfile
        .keep()
        .map_err(|e| SupervisorError::process("nbdkit", format!("unable to keep pid file: {}", e)))?;
    Ok(path)
}

fn read_stream<R>(pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(pipe);
        let _ = reader.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn drain(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Recover diagnostics from a helper's log file. Binary read with lossy
/// decode — helper output is not guaranteed UTF-8.
fn read_log(path: &Path, program: &str) -> Result<String, SupervisorError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).trim().to_string()),
        Err(e) => Err(SupervisorError::process(
            program,
            format!("unable to read log file {}: {}", path.display(), e),
        )),
    }
}

/// Resolve the true PID a forking helper recorded in its pid-file. A file
/// the helper has not written yet is a caller-visible error, not retried.
fn read_pid_file(path: &Path, program: &str) -> Result<u32, SupervisorError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SupervisorError::process(
            program,
            format!("unable to read pid file {}: {}", path.display(), e),
        )
    })?;
    content.trim().parse::<u32>().map_err(|e| {
        SupervisorError::process(
            program,
            format!("invalid pid in {}: {}", path.display(), e),
        )
    })
}
