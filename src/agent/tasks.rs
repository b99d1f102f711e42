//! The three analysis tasks run for every session.
//!
//! Each task reports "<label> started" before touching the sample and one of
//! "completed", "failed" or "timed out" when it reaches a terminal state.
//! A status that cannot be delivered is logged and otherwise ignored.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalogue::{self, BEHAVIOR_OUTPUT, CAPTURE_OUTPUT};
use super::filetype::FileType;
use crate::concurrency::Deadline;
use crate::control::{Reporter, SessionId};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, Exit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotRun,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Static,
    Behavior,
    Network,
}

impl TaskKind {
    pub fn label(self) -> &'static str {
        match self {
            TaskKind::Static => "Static Analysis",
            TaskKind::Behavior => "Behavior Analysis",
            TaskKind::Network => "Network Sniffing",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(skip)]
    pub stdout: Vec<u8>,
    #[serde(skip)]
    pub stderr: Vec<u8>,
    pub artifacts: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl TaskOutcome {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            status: TaskStatus::NotRun,
            stdout: Vec::new(),
            stderr: Vec::new(),
            artifacts: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn absorb(&mut self, output: &CommandOutput) {
        self.stdout.extend_from_slice(&output.stdout);
        self.stderr.extend_from_slice(&output.stderr);
    }

    fn fail(mut self, error: String) -> Self {
        self.status = TaskStatus::Failed;
        self.errors.push(error);
        self
    }
}

/// Everything a task needs to know about the session it runs in.
pub struct TaskContext {
    pub session: SessionId,
    pub file_type: FileType,
    pub executor: Option<String>,
    pub staging: PathBuf,
    pub sample: PathBuf,
    pub yara_rules: String,
    pub privilege_prefix: Vec<String>,
    pub harness_module: String,
    pub capture_interface: Option<String>,
    pub runner: Arc<dyn CommandRunner>,
    pub reporter: Arc<dyn Reporter>,
}

impl TaskContext {
    pub async fn report(&self, message: String, error: Option<String>) {
        if let Err(e) = self.reporter.status(&self.session, &message, error).await {
            warn!(
                "Could not deliver status '{}' for {}: {}",
                message, self.session, e
            );
        }
    }

    async fn report_outcome(&self, outcome: &TaskOutcome) {
        let label = outcome.kind.label();
        match outcome.status {
            TaskStatus::Succeeded => self.report(format!("{} completed", label), None).await,
            TaskStatus::TimedOut => {
                self.report(
                    format!("{} timed out", label),
                    Some(outcome.errors.join("; ")),
                )
                .await
            }
            TaskStatus::Failed | TaskStatus::NotRun => {
                self.report(format!("{} failed", label), Some(outcome.errors.join("; ")))
                    .await
            }
        }
    }

    /// `program` behind the configured privilege prefix (e.g. `sudo`).
    fn privileged(&self, program: &str) -> CommandSpec {
        match self.privilege_prefix.split_first() {
            Some((first, rest)) => CommandSpec::new(first)
                .args(rest.iter().cloned())
                .arg(program),
            None => CommandSpec::new(program),
        }
    }
}

/// Command line the harness executes: the sample itself, or `<executor> <sample>`.
pub fn execution_command(executor: Option<&str>, sample: &Path) -> String {
    match executor.map(str::trim).filter(|e| !e.is_empty()) {
        Some(executor) => format!("{} {}", executor, sample.display()),
        None => sample.display().to_string(),
    }
}

/// Run every catalogue command applicable to the sample's file type.
pub async fn static_analysis(ctx: &TaskContext, deadline: &Deadline) -> TaskOutcome {
    let mut outcome = TaskOutcome::new(TaskKind::Static);
    ctx.report(format!("{} started", TaskKind::Static.label()), None)
        .await;

    let mut timed_out = false;
    for cmd in catalogue::applicable(ctx.file_type) {
        if let Some(reason) = deadline.reason() {
            outcome.errors.push(format!("{}: not started, {}", cmd.name, reason));
            timed_out = true;
            break;
        }

        let spec = cmd.spec(&ctx.sample, &ctx.yara_rules);
        let output = match ctx.runner.run_until(&spec, deadline).await {
            Ok(output) => output,
            Err(e) => {
                outcome.errors.push(format!("{}: {}", cmd.name, e));
                continue;
            }
        };

        let path = ctx.staging.join(cmd.output);
        match tokio::fs::write(&path, output.combined()).await {
            Ok(()) => outcome.artifacts.push(path),
            Err(e) => outcome
                .errors
                .push(format!("{}: could not write {}: {}", cmd.name, path.display(), e)),
        }
        outcome.absorb(&output);

        if let Err(e) = output.into_result(&spec) {
            timed_out |= e.is_cancelled();
            outcome.errors.push(format!("{}: {}", cmd.name, e));
        } else {
            debug!("{} finished for {}", cmd.name, ctx.session);
        }
    }

    outcome.status = if timed_out {
        TaskStatus::TimedOut
    } else if outcome.errors.is_empty() {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };
    ctx.report_outcome(&outcome).await;
    outcome
}

/// Detonate the sample under the instrumentation harness.
pub async fn behavior_analysis(ctx: &TaskContext, deadline: &Deadline) -> TaskOutcome {
    let outcome = TaskOutcome::new(TaskKind::Behavior);
    ctx.report(format!("{} started", TaskKind::Behavior.label()), None)
        .await;

    if !tokio::fs::try_exists(&ctx.sample).await.unwrap_or(false) {
        let outcome = outcome.fail(format!(
            "sample not found at {}",
            ctx.sample.display()
        ));
        ctx.report_outcome(&outcome).await;
        return outcome;
    }

    let command = execution_command(ctx.executor.as_deref(), &ctx.sample);
    let spec = ctx
        .privileged("staprun")
        .args(["-R", "-c"])
        .arg(command)
        .arg(&ctx.harness_module);
    info!("Detonating sample for {}: {}", ctx.session, spec);

    let mut outcome = match ctx.runner.run_until(&spec, deadline).await {
        Ok(output) => {
            let mut outcome = outcome;
            let path = ctx.staging.join(BEHAVIOR_OUTPUT);
            match tokio::fs::write(&path, output.combined()).await {
                Ok(()) => outcome.artifacts.push(path),
                Err(e) => outcome
                    .errors
                    .push(format!("could not write {}: {}", path.display(), e)),
            }
            outcome.absorb(&output);
            match output.into_result(&spec) {
                Ok(_) => outcome.status = TaskStatus::Succeeded,
                Err(e) => {
                    outcome.status = if e.is_cancelled() {
                        TaskStatus::TimedOut
                    } else {
                        TaskStatus::Failed
                    };
                    outcome.errors.push(e.to_string());
                }
            }
            outcome
        }
        Err(e) => outcome.fail(e.to_string()),
    };

    if outcome.status == TaskStatus::Succeeded && !outcome.errors.is_empty() {
        outcome.status = TaskStatus::Failed;
    }
    ctx.report_outcome(&outcome).await;
    outcome
}

/// Capture traffic until `stop` fires. Exiting on its own is unexpected.
pub async fn network_capture(ctx: &TaskContext, stop: &Deadline) -> TaskOutcome {
    let mut outcome = TaskOutcome::new(TaskKind::Network);
    ctx.report(format!("{} started", TaskKind::Network.label()), None)
        .await;

    let capture = ctx.staging.join(CAPTURE_OUTPUT);
    let mut spec = ctx.privileged("tcpdump");
    if let Some(interface) = &ctx.capture_interface {
        spec = spec.args(["-i", interface.as_str()]);
    }
    let spec = spec.args(["-s", "65535", "-w"]).arg(capture.display().to_string());

    outcome = match ctx.runner.run_until(&spec, stop).await {
        Ok(output) => {
            outcome.absorb(&output);
            match output.exit {
                Exit::Cancelled(reason) => {
                    debug!("Packet capture for {} stopped: {}", ctx.session, reason);
                    outcome.status = TaskStatus::Succeeded;
                    outcome
                }
                Exit::Code(0) => {
                    warn!("Packet capture for {} exited before being stopped", ctx.session);
                    outcome.status = TaskStatus::Succeeded;
                    outcome
                }
                _ => match output.into_result(&spec) {
                    Err(e) => outcome.fail(e.to_string()),
                    Ok(_) => outcome,
                },
            }
        }
        Err(e) => outcome.fail(e.to_string()),
    };

    if tokio::fs::try_exists(&capture).await.unwrap_or(false) {
        outcome.artifacts.push(capture);
    }
    ctx.report_outcome(&outcome).await;
    outcome
}
