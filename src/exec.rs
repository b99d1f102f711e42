//! Command Runner capability.
//!
//! Analysis tools, the instrumentation harness, packet capture and the
//! memory forensics tool are all opaque external commands. Everything above
//! this module talks to them through [`CommandRunner`] so tests can count
//! invocations without spawning processes.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::concurrency::{CancelReason, Deadline};
use crate::error::{Error, Result};

/// How long to keep draining pipes after the child is gone. Grandchildren
/// (e.g. a tool started through `sudo`) may hold them open after a kill.
const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Exit {
    Code(i32),
    /// Terminated by a signal outside our control.
    Signal,
    /// Killed because the deadline fired.
    Cancelled(CancelReason),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit: Exit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit: Exit::Code(code),
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        Self {
            exit: Exit::Cancelled(reason),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit == Exit::Code(0)
    }

    /// stdout followed by stderr, the way a terminal would interleave them
    /// for a tool that writes diagnostics last.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }

    /// Turn a non-zero exit into [`Error::Execution`] and a kill into [`Error::Cancelled`].
    pub fn into_result(self, spec: &CommandSpec) -> Result<Self> {
        match self.exit {
            Exit::Code(0) => Ok(self),
            Exit::Cancelled(reason) => Err(Error::Cancelled(reason)),
            Exit::Code(code) => Err(Error::execution(
                spec.to_string(),
                failure_detail(&format!("exit status {}", code), &self.stderr),
            )),
            Exit::Signal => Err(Error::execution(
                spec.to_string(),
                failure_detail("terminated by signal", &self.stderr),
            )),
        }
    }
}

fn failure_detail(status: &str, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    match stderr.lines().find(|l| !l.trim().is_empty()) {
        Some(line) => format!("{}: {}", status, line.trim()),
        None => status.to_string(),
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. `Err` only when the program could not be started.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run until the command exits or `deadline` fires, whichever comes first.
    /// On cancellation the child is killed and the output captured so far is kept.
    async fn run_until(&self, spec: &CommandSpec, deadline: &Deadline) -> Result<CommandOutput>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct TokioRunner;

impl TokioRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {}", spec);
        let output = Self::command(spec)
            .output()
            .await
            .map_err(|e| Error::execution(spec.to_string(), e.to_string()))?;

        Ok(CommandOutput {
            exit: exit_of(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn run_until(&self, spec: &CommandSpec, deadline: &Deadline) -> Result<CommandOutput> {
        if let Some(reason) = deadline.reason() {
            debug!("Not starting {}: {}", spec, reason);
            return Ok(CommandOutput::cancelled(reason));
        }

        debug!("Running {} under deadline", spec);
        let mut child = Self::command(spec)
            .spawn()
            .map_err(|e| Error::execution(spec.to_string(), e.to_string()))?;

        let (stdout, stdout_task) = drain(child.stdout.take());
        let (stderr, stderr_task) = drain(child.stderr.take());

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::execution(spec.to_string(), e.to_string()))?;
                exit_of(status)
            }
            reason = deadline.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", spec, e);
                }
                Exit::Cancelled(reason)
            }
        };

        Ok(CommandOutput {
            exit,
            stdout: settle(stdout, stdout_task).await,
            stderr: settle(stderr, stderr_task).await,
        })
    }
}

fn exit_of(status: ExitStatus) -> Exit {
    status.code().map(Exit::Code).unwrap_or(Exit::Signal)
}

type Captured = Arc<Mutex<Vec<u8>>>;

fn drain<R>(reader: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured: Captured = Arc::default();
    let sink = Arc::clone(&captured);
    let task = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    (captured, task)
}

async fn settle(captured: Captured, mut task: JoinHandle<()>) -> Vec<u8> {
    if tokio::time::timeout(PIPE_GRACE, &mut task).await.is_err() {
        task.abort();
    }
    std::mem::take(&mut *captured.lock().unwrap_or_else(|p| p.into_inner()))
}
