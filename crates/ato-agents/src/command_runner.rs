//! Shell command execution with streamed output and forced termination.
//!
//! Two entry points share one output pump:
//! - [`run`] drives validation and step commands, stopping when a kill token fires
//! - [`run_oneshot`] is the standalone variant with a wall-clock limit, SIGTERM,
//!   a grace period, then SIGKILL

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exit code reported for a command killed after its time limit.
pub const TIMEOUT_EXIT_CODE: i32 = 137;

const CHUNK_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("i/o error while running `{command}`: {message}")]
    Io { command: String, message: String },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives every output chunk as it arrives.
pub trait OutputSink: Send + Sync {
    fn on_chunk(&self, stream: OutputStream, chunk: &str);
}

impl<F> OutputSink for F
where
    F: Fn(OutputStream, &str) + Send + Sync,
{
    fn on_chunk(&self, stream: OutputStream, chunk: &str) {
        self(stream, chunk)
    }
}

/// Discards output.
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_chunk(&self, _stream: OutputStream, _chunk: &str) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Both streams interleaved in arrival order.
    pub output: String,
    /// The command was stopped by a kill token or its time limit.
    pub killed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct Captured {
    stdout: String,
    stderr: String,
    combined: String,
}

impl Captured {
    fn push(&mut self, stream: OutputStream, chunk: &str) {
        match stream {
            OutputStream::Stdout => self.stdout.push_str(chunk),
            OutputStream::Stderr => self.stderr.push_str(chunk),
        }
        self.combined.push_str(chunk);
    }
}

/// Incremental UTF-8 decoding for one pipe. An incomplete trailing sequence
/// is held back until the next read.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RunningProcess {
    handle_id: Uuid,
    command: String,
    started_at: DateTime<Utc>,
    kill: CancellationToken,
}

/// Running child processes keyed by owning task, so cancellation can reach them.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<DashMap<Uuid, RunningProcess>>,
}

/// Registration for one running command; deregisters on drop.
pub struct ProcessHandle {
    task_id: Uuid,
    handle_id: Uuid,
    kill: CancellationToken,
    registry: Arc<DashMap<Uuid, RunningProcess>>,
}

impl ProcessHandle {
    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.registry
            .remove_if(&self.task_id, |_, p| p.handle_id == self.handle_id);
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command` for `task_id`. Cancelling `parent` also kills it.
    pub fn register(
        &self,
        task_id: Uuid,
        command: &str,
        parent: &CancellationToken,
    ) -> ProcessHandle {
        let handle_id = Uuid::new_v4();
        let kill = parent.child_token();
        self.inner.insert(
            task_id,
            RunningProcess {
                handle_id,
                command: command.to_string(),
                started_at: Utc::now(),
                kill: kill.clone(),
            },
        );
        ProcessHandle {
            task_id,
            handle_id,
            kill,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Force-kill the task's running command. Returns whether one was running.
    pub fn kill(&self, task_id: Uuid) -> bool {
        match self.inner.get(&task_id) {
            Some(entry) => {
                debug!(%task_id, command = %entry.command, "killing running command");
                entry.kill.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.inner.contains_key(&task_id)
    }

    /// Commands currently running, with their start times.
    pub fn running(&self) -> Vec<(Uuid, String, DateTime<Utc>)> {
        self.inner
            .iter()
            .map(|e| (*e.key(), e.command.clone(), e.started_at))
            .collect()
    }

    /// Kill everything and forget it.
    pub fn clear(&self) {
        for entry in self.inner.iter() {
            entry.kill.cancel();
        }
        self.inner.clear();
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    // Own process group so a kill reaches the shell's children too.
    cmd.process_group(0);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn spawn(command: &str, cwd: Option<&Path>) -> Result<Child> {
    let mut cmd = shell_command(command);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn().map_err(|e| RunnerError::Spawn {
        command: command.to_string(),
        message: e.to_string(),
    })
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: libc::c_int) {
    match child.id() {
        Some(pid) => {
            // SAFETY: plain syscall; a negative pid addresses the process group.
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
            if rc != 0 {
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    signal_group(child, libc::SIGKILL);
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.start_kill();
}

/// Read both pipes until EOF or until `stop` resolves. Returns whether `stop` won.
async fn pump(
    child: &mut Child,
    command: &str,
    sink: &dyn OutputSink,
    captured: &mut Captured,
    stop: impl Future<Output = ()>,
) -> Result<bool> {
    let io_err = |message: &str| RunnerError::Io {
        command: command.to_string(),
        message: message.to_string(),
    };
    let mut stdout = child.stdout.take().ok_or_else(|| io_err("stdout not piped"))?;
    let mut stderr = child.stderr.take().ok_or_else(|| io_err("stderr not piped"))?;

    let mut out_buf = [0u8; CHUNK_SIZE];
    let mut err_buf = [0u8; CHUNK_SIZE];
    let mut out_text = Utf8Decoder::default();
    let mut err_text = Utf8Decoder::default();
    let mut out_done = false;
    let mut err_done = false;
    tokio::pin!(stop);

    let mut emit = |stream: OutputStream, chunk: String| {
        if !chunk.is_empty() {
            sink.on_chunk(stream, &chunk);
            captured.push(stream, &chunk);
        }
    };

    while !(out_done && err_done) {
        let (stream, read) = tokio::select! {
            biased;
            _ = &mut stop => {
                emit(OutputStream::Stdout, out_text.finish());
                emit(OutputStream::Stderr, err_text.finish());
                return Ok(true);
            }
            r = stdout.read(&mut out_buf), if !out_done => (OutputStream::Stdout, r),
            r = stderr.read(&mut err_buf), if !err_done => (OutputStream::Stderr, r),
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                warn!(command, error = %e, "output pipe read failed");
                0
            }
        };
        let (buf, decoder, done) = match stream {
            OutputStream::Stdout => (&out_buf[..n], &mut out_text, &mut out_done),
            OutputStream::Stderr => (&err_buf[..n], &mut err_text, &mut err_done),
        };
        if n == 0 {
            *done = true;
            emit(stream, decoder.finish());
            continue;
        }
        emit(stream, decoder.decode(buf));
    }
    Ok(false)
}

async fn wait_code(child: &mut Child, command: &str) -> Result<i32> {
    let status = child.wait().await.map_err(|e| RunnerError::Io {
        command: command.to_string(),
        message: e.to_string(),
    })?;
    Ok(status.code().unwrap_or(1))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run `command` in `cwd`, streaming each chunk to `sink`.
///
/// When `kill` fires the process group is killed immediately and the result
/// has `killed` set.
pub async fn run(
    command: &str,
    cwd: Option<&Path>,
    sink: &dyn OutputSink,
    kill: &CancellationToken,
) -> Result<CommandOutput> {
    let started_at = Utc::now();
    let mut child = spawn(command, cwd)?;
    debug!(command, pid = ?child.id(), "command started");

    let mut captured = Captured::default();
    let killed = pump(&mut child, command, sink, &mut captured, kill.cancelled()).await?;
    if killed {
        force_kill(&mut child);
    }
    let exit_code = wait_code(&mut child, command).await?;
    debug!(command, exit_code, killed, "command finished");

    Ok(CommandOutput {
        command: command.to_string(),
        exit_code,
        success: exit_code == 0 && !killed,
        stdout: captured.stdout,
        stderr: captured.stderr,
        output: captured.combined,
        killed,
        started_at,
        finished_at: Utc::now(),
    })
}

/// Run `command` with a wall-clock limit.
///
/// On timeout the process group gets SIGTERM, then SIGKILL once `grace` has
/// passed. The result carries exit code 137 and a marker appended to stderr.
pub async fn run_oneshot(
    command: &str,
    cwd: Option<&Path>,
    sink: &dyn OutputSink,
    timeout: Duration,
    grace: Duration,
) -> Result<CommandOutput> {
    let started_at = Utc::now();
    let mut child = spawn(command, cwd)?;

    let mut captured = Captured::default();
    let timed_out = pump(
        &mut child,
        command,
        sink,
        &mut captured,
        tokio::time::sleep(timeout),
    )
    .await?;

    let exit_code = if timed_out {
        warn!(command, timeout_secs = timeout.as_secs(), "command timed out, terminating");
        terminate(&mut child);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            force_kill(&mut child);
        }
        let _ = wait_code(&mut child, command).await?;
        let marker = format!(
            "\n[killed: command exceeded {}s timeout]\n",
            timeout.as_secs()
        );
        sink.on_chunk(OutputStream::Stderr, &marker);
        captured.push(OutputStream::Stderr, &marker);
        TIMEOUT_EXIT_CODE
    } else {
        wait_code(&mut child, command).await?
    };

    Ok(CommandOutput {
        command: command.to_string(),
        exit_code,
        success: exit_code == 0,
        stdout: captured.stdout,
        stderr: captured.stderr,
        output: captured.combined,
        killed: timed_out,
        started_at,
        finished_at: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
