//! Drives one analysis session inside the guest.

use futures::future::join_all;
use serde::Serialize;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use super::catalogue::ARTIFACTS;
use super::filetype::FileType;
use super::tasks::{self, TaskContext, TaskKind, TaskOutcome, TaskStatus};
use crate::concurrency::Deadline;
use crate::config::AgentConfig;
use crate::control::{Reporter, SessionId};
use crate::exec::CommandRunner;

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session: SessionId,
    pub file_type: FileType,
    pub executor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: SessionId,
    pub file_type: FileType,
    pub outcomes: Vec<TaskOutcome>,
    /// Artifact names the host acknowledged.
    pub submitted: Vec<String>,
    pub finished_delivered: bool,
}

impl SessionReport {
    pub fn status_of(&self, kind: TaskKind) -> TaskStatus {
        self.outcomes
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| o.status)
            .unwrap_or(TaskStatus::NotRun)
    }
}

pub struct Orchestrator {
    config: AgentConfig,
    runner: Arc<dyn CommandRunner>,
    reporter: Arc<dyn Reporter>,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        runner: Arc<dyn CommandRunner>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            runner,
            reporter,
        }
    }

    /// Run a session under the configured deadline.
    pub async fn run(&self, request: SessionRequest) -> SessionReport {
        self.run_with_deadline(request, Deadline::after(self.config.deadline()))
            .await
    }

    pub async fn run_with_deadline(&self, request: SessionRequest, deadline: Deadline) -> SessionReport {
        info!(
            "Starting analysis {} ({} sample, executor {:?})",
            request.session, request.file_type, request.executor
        );
        let ctx = Arc::new(self.context(&request));
        clear_stale_artifacts(&ctx).await;

        let capture_stop = deadline.child();

        let static_task = {
            let (ctx, deadline) = (Arc::clone(&ctx), deadline.clone());
            tokio::spawn(async move { tasks::static_analysis(&ctx, &deadline).await })
        };
        let behavior_task = {
            let (ctx, deadline) = (Arc::clone(&ctx), deadline.clone());
            tokio::spawn(async move { tasks::behavior_analysis(&ctx, &deadline).await })
        };
        let network_task = {
            let (ctx, stop) = (Arc::clone(&ctx), capture_stop.clone());
            tokio::spawn(async move { tasks::network_capture(&ctx, &stop).await })
        };

        let (static_joined, behavior_joined) = tokio::join!(static_task, behavior_task);
        debug!("Bounded tasks done for {}, stopping capture", request.session);
        capture_stop.cancel();
        let network_joined = network_task.await;

        let mut outcomes = Vec::with_capacity(3);
        for (kind, joined) in [
            (TaskKind::Static, static_joined),
            (TaskKind::Behavior, behavior_joined),
            (TaskKind::Network, network_joined),
        ] {
            outcomes.push(settle(&ctx, kind, joined).await);
        }

        let submitted = self.submit_artifacts(&ctx).await;

        let finished_delivered = match self.reporter.finished(&request.session).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not deliver finished signal for {}: {}", request.session, e);
                false
            }
        };
        info!(
            "Analysis {} done: {} artifacts submitted",
            request.session,
            submitted.len()
        );

        SessionReport {
            session: request.session,
            file_type: request.file_type,
            outcomes,
            submitted,
            finished_delivered,
        }
    }

    fn context(&self, request: &SessionRequest) -> TaskContext {
        TaskContext {
            session: request.session.clone(),
            file_type: request.file_type,
            executor: request.executor.clone(),
            staging: self.config.staging_path(),
            sample: self.config.sample_path(),
            yara_rules: self.config.yara_rules.clone(),
            privilege_prefix: self.config.privilege_prefix.clone(),
            harness_module: self.config.harness_module.clone(),
            capture_interface: self.config.capture_interface.clone(),
            runner: Arc::clone(&self.runner),
            reporter: Arc::clone(&self.reporter),
        }
    }

    /// Upload every well-known artifact that exists. Unreadable files and
    /// rejected uploads are logged and skipped.
    async fn submit_artifacts(&self, ctx: &TaskContext) -> Vec<String> {
        let uploads = ARTIFACTS.iter().map(|name| async move {
            let path = ctx.staging.join(name);
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("No {} produced for {}", name, ctx.session);
                    return None;
                }
                Err(e) => {
                    warn!("Could not read artifact {}: {}", path.display(), e);
                    return None;
                }
            };

            match self
                .reporter
                .submit_artifact(&ctx.session, name, content)
                .await
            {
                Ok(()) => Some(name.to_string()),
                Err(e) => {
                    warn!("Could not submit {} for {}: {}", name, ctx.session, e);
                    None
                }
            }
        });

        join_all(uploads).await.into_iter().flatten().collect()
    }
}

/// A task that panicked never reported its end; do it on its behalf.
async fn settle(
    ctx: &TaskContext,
    kind: TaskKind,
    joined: Result<TaskOutcome, JoinError>,
) -> TaskOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            let error = format!("task aborted: {}", e);
            warn!("{} for {}: {}", kind.label(), ctx.session, error);
            ctx.report(format!("{} failed", kind.label()), Some(error.clone()))
                .await;
            let mut outcome = TaskOutcome::new(kind);
            outcome.status = TaskStatus::Failed;
            outcome.errors.push(error);
            outcome
        }
    }
}

// Outputs left by an earlier session must not be submitted under this one.
async fn clear_stale_artifacts(ctx: &TaskContext) {
    for name in ARTIFACTS {
        let path = ctx.staging.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed stale {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove stale {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tasks::tests::Log;
    use crate::concurrency::CancelReason;
    use crate::control::MockReporter;
    use crate::error::Error;
    use crate::exec::{CommandOutput, Exit, MockCommandRunner};
    use std::path::Path;
    use std::sync::Mutex;

    fn config(staging: &Path) -> AgentConfig {
        AgentConfig {
            staging_dir: staging.display().to_string(),
            privilege_prefix: Vec::new(),
            ..AgentConfig::default()
        }
    }

    /// Reporter recording every control message in order.
    fn recording_reporter(log: &Log, reject: &'static [&'static str]) -> MockReporter {
        let mut reporter = MockReporter::new();

        let sink = Arc::clone(log);
        reporter.expect_status().returning(move |_, message, _| {
            sink.lock().unwrap().push(format!("status: {}", message));
            Ok(())
        });

        let sink = Arc::clone(log);
        reporter
            .expect_submit_artifact()
            .returning(move |_, name, content| {
                if reject.iter().any(|r| *r == name) {
                    return Err(Error::Transport("collection returned 500".into()));
                }
                sink.lock()
                    .unwrap()
                    .push(format!("artifact: {} ({} bytes)", name, content.len()));
                Ok(())
            });

        let sink = Arc::clone(log);
        reporter.expect_finished().times(1).returning(move |id| {
            sink.lock().unwrap().push(format!("finished: {}", id));
            Ok(())
        });

        reporter
    }

    /// Runner that fakes every tool and writes what a real capture would.
    fn fake_tools(staging: &Path) -> MockCommandRunner {
        let pcap = staging.join("capture.pcap");
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_until()
            .returning(move |spec, deadline| match spec.program.as_str() {
                "tcpdump" => {
                    std::fs::write(&pcap, b"pcap").unwrap();
                    Ok(CommandOutput::cancelled(
                        deadline.reason().unwrap_or(CancelReason::Stopped),
                    ))
                }
                "staprun" => Ok(CommandOutput::exited(0, "execve(/tmp/binary)\n")),
                "yara" => Ok(CommandOutput {
                    exit: Exit::Code(1),
                    stdout: Vec::new(),
                    stderr: b"error: rules not found\n".to_vec(),
                }),
                _ => Ok(CommandOutput::exited(0, "out")),
            });
        runner
    }

    fn request(file_type: FileType) -> SessionRequest {
        SessionRequest {
            session: SessionId::parse("abc-123").unwrap(),
            file_type,
            executor: None,
        }
    }

    #[tokio::test]
    async fn partial_failure_still_collects_and_finishes_once() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("binary"), b"\x7fELF").unwrap();
        let log: Log = Arc::default();

        let orchestrator = Orchestrator::new(
            config(tmp.path()),
            Arc::new(fake_tools(tmp.path())),
            Arc::new(recording_reporter(&log, &[])),
        );
        let report = orchestrator.run(request(FileType::Elf)).await;

        assert_eq!(report.status_of(TaskKind::Static), TaskStatus::Failed);
        assert_eq!(report.status_of(TaskKind::Behavior), TaskStatus::Succeeded);
        assert_eq!(report.status_of(TaskKind::Network), TaskStatus::Succeeded);
        assert!(report.finished_delivered);

        let mut submitted = report.submitted.clone();
        submitted.sort();
        assert_eq!(
            submitted,
            [
                "behave.txt",
                "capture.pcap",
                "objdump.txt",
                "readelf.txt",
                "strings.txt",
                "yara.txt"
            ]
        );

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| l.starts_with("finished")).count(), 1);
        assert_eq!(log.last().unwrap(), "finished: abc-123");
        for label in ["Static Analysis", "Behavior Analysis", "Network Sniffing"] {
            let started = log
                .iter()
                .position(|l| *l == format!("status: {} started", label))
                .unwrap();
            let ended = log
                .iter()
                .position(|l| l.starts_with(&format!("status: {} ", label)) && !l.ends_with("started"))
                .unwrap();
            assert!(started < ended, "{label}");
        }
    }

    #[tokio::test]
    async fn rejected_upload_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("binary"), b"MZ").unwrap();
        let log: Log = Arc::default();

        let orchestrator = Orchestrator::new(
            config(tmp.path()),
            Arc::new(fake_tools(tmp.path())),
            Arc::new(recording_reporter(&log, &["capture.pcap"])),
        );
        let report = orchestrator.run(request(FileType::Pe)).await;

        assert!(!report.submitted.contains(&"capture.pcap".to_string()));
        assert!(report.submitted.contains(&"behave.txt".to_string()));
        assert!(!report.submitted.contains(&"objdump.txt".to_string()));
        assert_eq!(log.lock().unwrap().last().unwrap(), "finished: abc-123");
    }

    #[tokio::test]
    async fn stale_outputs_are_not_resubmitted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("binary"), b"MZ").unwrap();
        std::fs::write(tmp.path().join("objdump.txt"), b"from an elf run").unwrap();
        let log: Log = Arc::default();

        let orchestrator = Orchestrator::new(
            config(tmp.path()),
            Arc::new(fake_tools(tmp.path())),
            Arc::new(recording_reporter(&log, &[])),
        );
        let report = orchestrator.run(request(FileType::Pe)).await;

        assert!(!report.submitted.contains(&"objdump.txt".to_string()));
    }

    #[tokio::test]
    async fn missing_sample_fails_behavior_only() {
        let tmp = tempfile::tempdir().unwrap();
        let log: Log = Arc::default();
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();

        let mut runner = MockCommandRunner::new();
        let sink = Arc::clone(&calls);
        runner.expect_run_until().returning(move |spec, _| {
            sink.lock().unwrap().push(spec.program.clone());
            Ok(CommandOutput::exited(0, ""))
        });

        let orchestrator = Orchestrator::new(
            config(tmp.path()),
            Arc::new(runner),
            Arc::new(recording_reporter(&log, &[])),
        );
        let report = orchestrator.run(request(FileType::Unknown)).await;

        assert_eq!(report.status_of(TaskKind::Behavior), TaskStatus::Failed);
        assert_eq!(report.status_of(TaskKind::Static), TaskStatus::Succeeded);
        assert!(!calls.lock().unwrap().contains(&"staprun".to_string()));
        assert!(report.finished_delivered);
    }
}
