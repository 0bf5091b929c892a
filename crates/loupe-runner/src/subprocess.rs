//! Agent subprocess management: spawn, stream stdout records, enforce the
//! wall-clock budget, and escalate termination.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 8 * 1024;

/// How long output is still collected after the agent exits. A background
/// process it left behind may hold the pipe open indefinitely.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The executable could not be started (missing, not executable, ...).
    #[error("failed to start agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("agent i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process ended on its own.
    Exited,
    /// Killed after exceeding the wall-clock budget.
    TimedOut,
    /// Killed on request.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub reason: ExitReason,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.reason == ExitReason::Exited && self.exit_code == Some(0)
    }
}

/// Limits applied to one run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

/// Splits raw output chunks into newline-terminated records.
///
/// A record spanning several chunks is joined; the trailing partial record
/// is held until more data arrives or [`LineBuffer::finish`] flushes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left after the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

enum Stop {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Spawn `command` and stream its stdout records to `on_record`.
///
/// Stderr is only traced. The run ends when the process exits, the timeout
/// elapses, or `cancel` fires; the latter two go through [`terminate`].
pub async fn run_streaming<F>(
    mut command: Command,
    limits: RunLimits,
    cancel: &CancellationToken,
    mut on_record: F,
) -> Result<AgentExit, AgentError>
where
    F: FnMut(&str),
{
    let program = command.as_std().get_program().to_string_lossy().to_string();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| AgentError::Spawn {
        command: program.clone(),
        source,
    })?;
    tracing::debug!(command = %program, pid = ?child.id(), "agent spawned");

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("agent stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("agent stderr not captured"))?;
    let mut stderr_lines = BufReader::new(stderr).lines();

    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);

    let mut records = LineBuffer::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;

    let stop = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Stop::Cancelled,
            _ = &mut deadline => break Stop::TimedOut,
            read = stdout.read(&mut chunk), if stdout_open => match read {
                Ok(0) => {
                    stdout_open = false;
                    if let Some(rest) = records.finish() {
                        on_record(&rest);
                    }
                }
                Ok(n) => {
                    for record in records.push(&chunk[..n]) {
                        on_record(&record);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading agent stdout");
                    stdout_open = false;
                }
            },
            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => tracing::debug!(stream = "stderr", "{line}"),
                Ok(None) => stderr_open = false,
                Err(e) => {
                    tracing::debug!(error = %e, "error reading agent stderr");
                    stderr_open = false;
                }
            },
            status = child.wait() => break Stop::Exited(status?),
        }
    };

    if matches!(stop, Stop::Exited(_)) && stdout_open {
        let drain = async {
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for record in records.push(&chunk[..n]) {
                            on_record(&record);
                        }
                    }
                }
            }
        };
        if tokio::time::timeout(STDOUT_DRAIN, drain).await.is_err() {
            tracing::debug!(command = %program, "stdout still open after agent exit, not waiting");
        }
        if let Some(rest) = records.finish() {
            on_record(&rest);
        }
    }

    let (reason, exit_code) = match stop {
        Stop::Exited(status) => (ExitReason::Exited, status.code()),
        Stop::TimedOut => {
            tracing::warn!(command = %program, timeout = ?limits.timeout, "agent timed out");
            (ExitReason::TimedOut, terminate(&mut child, limits.kill_grace).await)
        }
        Stop::Cancelled => {
            tracing::info!(command = %program, "agent cancelled");
            (ExitReason::Cancelled, terminate(&mut child, limits.kill_grace).await)
        }
    };

    let exit = AgentExit {
        reason,
        exit_code,
        elapsed: started.elapsed(),
    };
    tracing::debug!(?exit, "agent finished");
    Ok(exit)
}

/// Ask the process to stop with SIGTERM, then kill it if it is still alive
/// after `grace`. Returns the exit code, if any.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => return status.code(),
                Ok(Err(e)) => tracing::warn!(pid, error = %e, "wait after SIGTERM failed"),
                Err(_) => tracing::warn!(pid, ?grace, "agent ignored SIGTERM, killing"),
            },
            Err(e) => tracing::warn!(pid, error = %e, "failed to send SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill agent");
    }
    child.wait().await.ok().and_then(|status| status.code())
}
