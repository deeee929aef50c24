//! Owns the protocol client OS process for one endpoint.
//!
//! Stdout and stderr are read by two tasks that merge lines into one channel,
//! so a single consumer sees every line in arrival order per stream. The child
//! is spawned with `kill_on_drop`, so a panicking owner still reclaims it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::endpoint_state::EndpointHandle;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_PROTOCOL_CLIENT_PROGRAM: &str = "go-cqhttp/go-cqhttp";
const DEFAULT_PROTOCOL_CLIENT_ARG: &str = "faststart";

#[derive(Debug, Error)]
/// Enumerates supported `EndpointSupervisorError` values.
pub enum EndpointSupervisorError {
    #[error("protocol client program must be non-empty")]
    EmptyProgram,
    #[error("failed to spawn '{program}' in {work_dir}: {source}")]
    Spawn {
        program: String,
        work_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol client {0} pipe was not captured")]
    MissingPipe(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// How the protocol client is launched.
pub struct SubprocessLaunchConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_program() -> PathBuf {
    PathBuf::from(DEFAULT_PROTOCOL_CLIENT_PROGRAM)
}

fn default_args() -> Vec<String> {
    vec![DEFAULT_PROTOCOL_CLIENT_ARG.to_string()]
}

impl Default for SubprocessLaunchConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            env: BTreeMap::new(),
        }
    }
}

impl SubprocessLaunchConfig {
    /// Relative paths with a directory component resolve against the gateway's
    /// current directory, because the child runs inside the endpoint work dir.
    /// Bare names are left for `PATH` lookup.
    pub fn resolved_program(&self) -> PathBuf {
        if self.program.is_absolute() || self.program.components().count() < 2 {
            return self.program.clone();
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(&self.program),
            Err(_) => self.program.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// How a process handle ended up released.
pub enum ProcessTermination {
    /// The process had exited on its own before we asked it to stop.
    Exited { status: String },
    /// We killed the process and reaped it.
    Killed { status: String },
    /// There was no live handle: never started, or already reaped.
    NotRunning,
    /// Reaping failed; logged, never propagated.
    WaitFailed { error: String },
}

impl ProcessTermination {
    pub fn describe(&self) -> String {
        match self {
            Self::Exited { status } => format!("exited ({status})"),
            Self::Killed { status } => format!("stopped ({status})"),
            Self::NotRunning => "not running".to_string(),
            Self::WaitFailed { error } => format!("wait failed: {error}"),
        }
    }
}

#[derive(Debug)]
/// A live protocol client plus its merged output stream.
pub struct ManagedProcess {
    child: Option<Child>,
    pid: Option<u32>,
    lines: mpsc::Receiver<OutputLine>,
}

/// Launches the protocol client with `work_dir` as its working directory.
pub fn spawn_managed_process(
    config: &SubprocessLaunchConfig,
    work_dir: &Path,
) -> Result<ManagedProcess, EndpointSupervisorError> {
    if config.program.as_os_str().is_empty() {
        return Err(EndpointSupervisorError::EmptyProgram);
    }
    let program = config.resolved_program();

    let mut command = Command::new(&program);
    command
        .args(&config.args)
        .envs(&config.env)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|source| EndpointSupervisorError::Spawn {
            program: program.display().to_string(),
            work_dir: work_dir.to_path_buf(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or(EndpointSupervisorError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(EndpointSupervisorError::MissingPipe("stderr"))?;

    let (line_tx, lines) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    spawn_output_reader(OutputStream::Stdout, stdout, line_tx.clone());
    spawn_output_reader(OutputStream::Stderr, stderr, line_tx);

    let pid = child.id();
    info!(
        program = %program.display(),
        work_dir = %work_dir.display(),
        pid = ?pid,
        "protocol client started"
    );
    Ok(ManagedProcess {
        child: Some(child),
        pid,
        lines,
    })
}

fn spawn_output_reader<R>(stream: OutputStream, reader: R, line_tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if line_tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(stream = stream.as_str(), error = %error, "output reader stopped");
                    break;
                }
            }
        }
    });
}

impl ManagedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output line; `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Blocks until the process exits on its own and reaps it. Cancel-safe: a
    /// dropped wait leaves the child in place for `stop`.
    pub async fn wait_for_exit(&mut self) -> ProcessTermination {
        let Some(child) = self.child.as_mut() else {
            return ProcessTermination::NotRunning;
        };
        let waited = child.wait().await;
        self.child = None;
        match waited {
            Ok(status) => ProcessTermination::Exited {
                status: status.to_string(),
            },
            Err(error) => ProcessTermination::WaitFailed {
                error: error.to_string(),
            },
        }
    }

    /// Asks the process to stop and waits until it has exited. Stopping an
    /// exited or already-reaped process is a checked no-op, not an error.
    pub async fn stop(&mut self) -> ProcessTermination {
        let Some(mut child) = self.child.take() else {
            return ProcessTermination::NotRunning;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                return ProcessTermination::Exited {
                    status: status.to_string(),
                }
            }
            Ok(None) => {}
            Err(error) => warn!(pid = ?self.pid, error = %error, "failed to poll protocol client"),
        }
        if let Err(error) = child.start_kill() {
            warn!(pid = ?self.pid, error = %error, "failed to signal protocol client");
        }
        match child.wait().await {
            Ok(status) => ProcessTermination::Killed {
                status: status.to_string(),
            },
            Err(error) => ProcessTermination::WaitFailed {
                error: error.to_string(),
            },
        }
    }
}

/// Full teardown for an endpoint's process: clear transient login flags, stop,
/// wait, and record how it ended. Never fails.
pub async fn stop_endpoint_process(
    endpoint: &EndpointHandle,
    process: &mut ManagedProcess,
) -> ProcessTermination {
    endpoint.clear_login_flags();
    let termination = process.stop().await;
    record_termination(endpoint, &termination);
    termination
}

pub(crate) fn record_termination(endpoint: &EndpointHandle, termination: &ProcessTermination) {
    endpoint.update(|record| {
        record.runtime.clear_login_flags();
        record.runtime.last_exit = Some(termination.describe());
    });
    match termination {
        ProcessTermination::WaitFailed { error } => warn!(
            endpoint_id = %endpoint.id(),
            error = %error,
            "protocol client cleanup failed"
        ),
        other => info!(
            endpoint_id = %endpoint.id(),
            outcome = %other.describe(),
            "protocol client exited"
        ),
    }
}
