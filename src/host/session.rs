//! Host session state machine.
//!
//! One [`SessionDriver`] walks a sandbox through a full analysis cycle:
//!
//! ```text
//! Idle -> BootingSandbox -> AwaitingAgent -> TransferringSample -> TriggeringAnalysis
//!      -> AwaitingFinished -> AcquiringMemory -> RevertingSandbox -> Done
//! ```
//!
//! `Failed` is reachable from every state. Whatever happens, the collection
//! server is drained and a sandbox that was booted or handed to the session is
//! stopped and reverted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::reputation::{VirusTotal, sha256_hex};
use super::server::CollectionServer;
use super::store::ArtifactStore;
use crate::agent::ARTIFACTS;
use crate::concurrency::{CancelReason, Deadline};
use crate::config::{HostConfig, SandboxDescriptor};
use crate::control::{AgentApi, SessionId};
use crate::error::{Error, Result};
use crate::forensics::{ForensicPipeline, ForensicReport};
use crate::machine::Machine;

/// Memory image written into the session directory.
pub const MEMORY_CAPTURE: &str = "memory.cap";
pub const REPUTATION_REPORT: &str = "reputation.json";
pub const SESSION_SUMMARY: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum HostState {
    Idle,
    BootingSandbox,
    AwaitingAgent,
    TransferringSample,
    TriggeringAnalysis,
    AwaitingFinished,
    AcquiringMemory,
    RevertingSandbox,
    Done,
    Failed(String),
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Idle => f.write_str("idle"),
            HostState::BootingSandbox => f.write_str("booting sandbox"),
            HostState::AwaitingAgent => f.write_str("awaiting agent"),
            HostState::TransferringSample => f.write_str("transferring sample"),
            HostState::TriggeringAnalysis => f.write_str("triggering analysis"),
            HostState::AwaitingFinished => f.write_str("awaiting finished"),
            HostState::AcquiringMemory => f.write_str("acquiring memory"),
            HostState::RevertingSandbox => f.write_str("reverting sandbox"),
            HostState::Done => f.write_str("done"),
            HostState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: HostState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub poll_interval: Duration,
    pub agent_timeout: Duration,
    pub finished_timeout: Duration,
    pub drain_timeout: Duration,
}

impl DriverSettings {
    pub fn from_config(host: &HostConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(host.poll_interval_secs),
            agent_timeout: Duration::from_secs(host.agent_timeout_secs),
            finished_timeout: Duration::from_secs(host.finished_timeout_secs),
            drain_timeout: Duration::from_secs(host.drain_timeout_secs),
        }
    }
}

/// The file under analysis.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub content: Vec<u8>,
    pub sha256: String,
    pub executor: Option<String>,
}

impl Sample {
    pub fn new(name: impl Into<String>, content: Vec<u8>, executor: Option<String>) -> Self {
        let sha256 = sha256_hex(&content);
        Self {
            name: name.into(),
            content,
            sha256,
            executor,
        }
    }

    pub async fn load(path: &Path, executor: Option<String>) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Resource(format!("'{}' is not a file", path.display())))?
            .to_string();
        let content = tokio::fs::read(path).await.map_err(|e| {
            Error::Resource(format!("could not read sample {}: {}", path.display(), e))
        })?;
        Ok(Self::new(name, content, executor))
    }
}

#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error("sandbox failed to boot: {0}")]
    Boot(Error),

    #[error("agent did not answer within {0:?}")]
    AgentTimeout(Duration),

    #[error("sample transfer rejected: {0}")]
    Transfer(Error),

    #[error("no finished signal within {0:?}")]
    FinishedTimeout(Duration),

    #[error("finished signal channel closed")]
    SignalLost,

    #[error("interrupted")]
    Interrupted(CancelReason),
}

/// What a session left behind, persisted as `session.json`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: SessionId,
    pub sandbox: String,
    pub sample: String,
    pub sample_sha256: String,
    pub state: HostState,
    pub trail: Vec<Transition>,
    pub received: BTreeSet<String>,
    pub missing_artifacts: Vec<String>,
    pub memory_capture: Option<PathBuf>,
    pub forensics: Option<ForensicReport>,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == HostState::Done
    }
}

pub struct SessionDriver {
    session: SessionId,
    descriptor: SandboxDescriptor,
    machine: Arc<dyn Machine>,
    agent: Arc<dyn AgentApi>,
    store: Arc<ArtifactStore>,
    forensics: Option<ForensicPipeline>,
    reputation: Option<VirusTotal>,
    settings: DriverSettings,
    state: HostState,
    trail: Vec<Transition>,
    sandbox_touched: bool,
}

impl SessionDriver {
    pub fn new(
        session: SessionId,
        descriptor: SandboxDescriptor,
        machine: Arc<dyn Machine>,
        agent: Arc<dyn AgentApi>,
        store: Arc<ArtifactStore>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            session,
            descriptor,
            machine,
            agent,
            store,
            forensics: None,
            reputation: None,
            settings,
            state: HostState::Idle,
            trail: vec![Transition {
                state: HostState::Idle,
                at: Utc::now(),
            }],
            sandbox_touched: false,
        }
    }

    pub fn with_forensics(mut self, pipeline: ForensicPipeline) -> Self {
        self.forensics = Some(pipeline);
        self
    }

    pub fn with_reputation(mut self, client: VirusTotal) -> Self {
        self.reputation = Some(client);
        self
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    /// Drive the session to `Done` or `Failed`. `interrupt` firing at any point
    /// skips ahead to draining and reverting.
    pub async fn run(
        mut self,
        sample: &Sample,
        mut server: CollectionServer,
        interrupt: &Deadline,
    ) -> SessionOutcome {
        info!(
            "Session {} on sandbox '{}': {} (sha256 {})",
            self.session, self.descriptor.name, sample.name, sample.sha256
        );
        self.lookup_reputation(sample).await;

        let driven = self.drive(sample, &mut server, interrupt).await;

        let received = server.shutdown(self.settings.drain_timeout).await;
        let missing_artifacts: Vec<String> = ARTIFACTS
            .iter()
            .filter(|name| !received.contains(**name))
            .map(|name| name.to_string())
            .collect();

        let captured = match driven {
            Ok(()) => {
                if !missing_artifacts.is_empty() {
                    warn!(
                        "Session {} finished without: {}",
                        self.session,
                        missing_artifacts.join(", ")
                    );
                }
                self.acquire_memory(interrupt).await
            }
            Err(failure) => Err(failure),
        };

        if self.sandbox_touched {
            self.revert().await;
        }

        let mut memory_capture = None;
        let mut forensics = None;
        match captured {
            Ok(capture) => {
                self.enter(HostState::Done);
                memory_capture = capture;
                if let Some(pipeline) = &self.forensics {
                    let target = self.store.session_dir(&self.session).join(MEMORY_CAPTURE);
                    forensics = Some(
                        pipeline
                            .run(
                                &target,
                                &self.descriptor.platform,
                                self.descriptor.profile.as_deref(),
                                interrupt,
                            )
                            .await,
                    );
                    if let Some(reason) = interrupt.reason() {
                        warn!(
                            "Forensic processing for {} cut short ({})",
                            self.session, reason
                        );
                    }
                }
            }
            Err(failure) => {
                match &failure {
                    Failure::Interrupted(reason) => {
                        warn!("Session {} interrupted ({})", self.session, reason)
                    }
                    other => error!("Session {} failed: {}", self.session, other),
                }
                self.enter(HostState::Failed(failure.to_string()));
            }
        }

        let outcome = SessionOutcome {
            session: self.session.clone(),
            sandbox: self.descriptor.name.clone(),
            sample: sample.name.clone(),
            sample_sha256: sample.sha256.clone(),
            state: self.state.clone(),
            trail: std::mem::take(&mut self.trail),
            received,
            missing_artifacts,
            memory_capture,
            forensics,
        };
        self.write_summary(&outcome).await;
        outcome
    }

    async fn drive(
        &mut self,
        sample: &Sample,
        server: &mut CollectionServer,
        interrupt: &Deadline,
    ) -> std::result::Result<(), Failure> {
        tokio::select! {
            biased;
            reason = interrupt.cancelled() => return Err(Failure::Interrupted(reason)),
            prepared = self.prepare(sample) => prepared?,
        }

        self.enter(HostState::AwaitingFinished);
        let limit = self.settings.finished_timeout;
        tokio::select! {
            biased;
            reason = interrupt.cancelled() => Err(Failure::Interrupted(reason)),
            signal = tokio::time::timeout(limit, server.finished_signal()) => match signal {
                Ok(Ok(id)) => {
                    info!("Guest finished session {}", id);
                    Ok(())
                }
                Ok(Err(_)) => Err(Failure::SignalLost),
                Err(_) => Err(Failure::FinishedTimeout(limit)),
            },
        }
    }

    async fn prepare(&mut self, sample: &Sample) -> std::result::Result<(), Failure> {
        self.enter(HostState::BootingSandbox);
        self.boot().await?;

        self.enter(HostState::AwaitingAgent);
        self.await_agent().await?;

        self.enter(HostState::TransferringSample);
        self.agent
            .transfer(&sample.name, sample.content.clone())
            .await
            .map_err(Failure::Transfer)?;
        info!(
            "Transferred {} ({} bytes) to '{}'",
            sample.name,
            sample.content.len(),
            self.descriptor.name
        );

        self.enter(HostState::TriggeringAnalysis);
        match self.agent.begin(&self.session, sample.executor.clone()).await {
            Ok(echoed) if echoed == self.session => {
                info!("Analysis {} started on '{}'", self.session, self.descriptor.name)
            }
            Ok(echoed) => warn!(
                "Agent acknowledged session {} while {} was requested",
                echoed, self.session
            ),
            Err(e) => warn!(
                "Agent rejected begin-analysis for {}: {}. Trigger it manually to continue",
                self.session, e
            ),
        }

        Ok(())
    }

    /// Marks the sandbox touched as soon as a start is issued, so an interrupt
    /// that drops this future mid-start still gets the VM reverted.
    async fn boot(&mut self) -> std::result::Result<(), Failure> {
        let name = self.descriptor.name.clone();
        let booted = match self.machine.is_running().await {
            Ok(true) => {
                info!("Sandbox '{}' is already running", name);
                Ok(())
            }
            Ok(false) => {
                info!("Starting sandbox '{}'", name);
                self.sandbox_touched = true;
                let started = self.machine.start().await.map_err(Failure::Boot);
                // a start that failed outright left nothing to clean up
                self.sandbox_touched = started.is_ok();
                started
            }
            Err(e) => {
                warn!(
                    "Could not query sandbox '{}' state: {}; probing its agent",
                    name, e
                );
                match self.agent.health().await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Failure::Boot(e)),
                    Err(probe) => {
                        debug!("Agent probe failed too: {}", probe);
                        Err(Failure::Boot(e))
                    }
                }
            }
        };
        if booted.is_ok() {
            self.sandbox_touched = true;
        }
        booted
    }

    async fn await_agent(&self) -> std::result::Result<(), Failure> {
        let give_up = Instant::now() + self.settings.agent_timeout;
        loop {
            match self.agent.health().await {
                Ok(true) => {
                    info!("Agent on '{}' is up", self.descriptor.name);
                    return Ok(());
                }
                Ok(false) => debug!("Agent on '{}' is not healthy yet", self.descriptor.name),
                Err(e) => debug!("Agent on '{}' unreachable: {}", self.descriptor.name, e),
            }

            if Instant::now() + self.settings.poll_interval > give_up {
                return Err(Failure::AgentTimeout(self.settings.agent_timeout));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// `Ok(None)` when the dump failed; forensics are best effort.
    async fn acquire_memory(
        &mut self,
        interrupt: &Deadline,
    ) -> std::result::Result<Option<PathBuf>, Failure> {
        self.enter(HostState::AcquiringMemory);

        let dir = match self.store.ensure_session_dir(&self.session).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("No result directory for {}: {}", self.session, e);
                return Ok(None);
            }
        };
        let capture = dir.join(MEMORY_CAPTURE);

        tokio::select! {
            biased;
            reason = interrupt.cancelled() => Err(Failure::Interrupted(reason)),
            dumped = self.machine.memory_dump(&capture) => match dumped {
                Ok(()) => {
                    info!("Memory of '{}' written to {}", self.descriptor.name, capture.display());
                    Ok(Some(capture))
                }
                Err(e) => {
                    warn!("Memory acquisition for {} failed: {}", self.session, e);
                    Ok(None)
                }
            },
        }
    }

    /// Stop and revert, each attempted regardless of the other.
    async fn revert(&mut self) {
        self.enter(HostState::RevertingSandbox);
        let name = &self.descriptor.name;

        if let Err(e) = self.machine.stop().await {
            warn!("Could not stop sandbox '{}': {}", name, e);
        }
        match self.machine.revert().await {
            Ok(()) => info!("Sandbox '{}' reverted", name),
            Err(e) => error!("Could not revert sandbox '{}': {}", name, e),
        }
    }

    async fn lookup_reputation(&self, sample: &Sample) {
        let Some(client) = &self.reputation else {
            return;
        };

        match client.lookup(&sample.sha256).await {
            Ok(Some(report)) => {
                let stored = match serde_json::to_vec_pretty(&report) {
                    Ok(bytes) => {
                        self.store
                            .write_artifact(&self.session, REPUTATION_REPORT, &bytes)
                            .await
                    }
                    Err(e) => Err(e.into()),
                };
                match stored {
                    Ok(path) => info!("Reputation report stored at {}", path.display()),
                    Err(e) => warn!("Could not store reputation report: {}", e),
                }
            }
            Ok(None) => info!("No reputation record for {}", sample.sha256),
            Err(e) => warn!("Reputation lookup for {} failed: {}", sample.sha256, e),
        }
    }

    async fn write_summary(&self, outcome: &SessionOutcome) {
        let written = match serde_json::to_vec_pretty(outcome) {
            Ok(bytes) => {
                self.store
                    .write_artifact(&self.session, SESSION_SUMMARY, &bytes)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            warn!("Could not write session summary for {}: {}", self.session, e);
        }
    }

    fn enter(&mut self, state: HostState) {
        debug!("Session {}: {} -> {}", self.session, self.state, state);
        self.trail.push(Transition {
            state: state.clone(),
            at: Utc::now(),
        });
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForensicsConfig;
    use crate::control::{HostClient, MockAgentApi, Reporter};
    use crate::exec::{CommandOutput, CommandRunner, CommandSpec, MockCommandRunner};
    use crate::machine::MockMachine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> SessionId {
        SessionId::parse("abc-123").unwrap()
    }

    fn descriptor() -> SandboxDescriptor {
        SandboxDescriptor {
            name: "ubuntu-guest".to_string(),
            uuid: None,
            snapshot: Some("clean".to_string()),
            address: "127.0.0.1:9001".to_string(),
            platform: "linux".to_string(),
            profile: Some("LinuxUbuntu1604x64".to_string()),
        }
    }

    fn settings() -> DriverSettings {
        DriverSettings {
            poll_interval: Duration::from_millis(10),
            agent_timeout: Duration::from_secs(1),
            finished_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
        }
    }

    fn sample() -> Sample {
        Sample::new("dropper.elf", b"\x7fELF\x02\x01\x01\x00".to_vec(), None)
    }

    async fn server(store: &Arc<ArtifactStore>) -> CollectionServer {
        CollectionServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            session(),
            Arc::clone(store),
            1024 * 1024,
        )
        .await
        .unwrap()
    }

    fn pipeline(tool: &Path, runner: MockCommandRunner) -> ForensicPipeline {
        let config = ForensicsConfig {
            enabled: true,
            interpreter: "python2.7".to_string(),
            tool_path: tool.display().to_string(),
            timeout_secs: 5,
        };
        ForensicPipeline::new(&config, Arc::new(runner))
    }

    fn states(outcome: &SessionOutcome) -> Vec<HostState> {
        outcome.trail.iter().map(|t| t.state.clone()).collect()
    }

    #[tokio::test]
    async fn happy_path_runs_every_stage_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path().join("results")));
        let tool = tmp.path().join("vol.py");
        std::fs::write(&tool, b"").unwrap();
        let server = server(&store).await;
        let host_url = format!("http://{}", server.local_addr());

        let mut machine = MockMachine::new();
        machine.expect_is_running().times(1).returning(|| Ok(false));
        machine.expect_start().times(1).returning(|| Ok(()));
        machine.expect_memory_dump().times(1).returning(|path| {
            std::fs::write(path, b"core").unwrap();
            Ok(())
        });
        machine.expect_stop().times(1).returning(|| Ok(()));
        machine.expect_revert().times(1).returning(|| Ok(()));

        let mut agent = MockAgentApi::new();
        agent.expect_health().returning(|| Ok(true));
        agent
            .expect_transfer()
            .withf(|name, content| name == "dropper.elf" && content.starts_with(b"\x7fELF"))
            .times(1)
            .returning(|_, _| Ok(()));
        agent
            .expect_begin()
            .times(1)
            .returning(move |requested, _| {
                let id = requested.clone();
                let client = HostClient::new(
                    &host_url,
                    Duration::from_secs(2),
                    Duration::from_secs(2),
                )
                .unwrap();
                tokio::spawn(async move {
                    client
                        .submit_artifact(&id, "strings.txt", b"ABC".to_vec())
                        .await
                        .unwrap();
                    client.finished(&id).await.unwrap();
                });
                Ok(requested.clone())
            });

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_until()
            .times(6)
            .returning(|_, _| Ok(CommandOutput::exited(0, "")));

        let driver = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            Arc::clone(&store),
            settings(),
        )
        .with_forensics(pipeline(&tool, runner));

        let outcome = driver.run(&sample(), server, &Deadline::never()).await;

        assert!(outcome.succeeded(), "{:?}", outcome.state);
        assert_eq!(
            states(&outcome),
            [
                HostState::Idle,
                HostState::BootingSandbox,
                HostState::AwaitingAgent,
                HostState::TransferringSample,
                HostState::TriggeringAnalysis,
                HostState::AwaitingFinished,
                HostState::AcquiringMemory,
                HostState::RevertingSandbox,
                HostState::Done,
            ]
        );

        let dir = tmp.path().join("results/abc-123");
        assert_eq!(std::fs::read(dir.join("strings.txt")).unwrap(), b"ABC");
        assert_eq!(outcome.memory_capture, Some(dir.join(MEMORY_CAPTURE)));
        assert!(dir.join(SESSION_SUMMARY).exists());

        assert!(outcome.received.contains("strings.txt"));
        assert_eq!(outcome.missing_artifacts.len(), ARTIFACTS.len() - 1);
        assert!(!outcome.missing_artifacts.contains(&"strings.txt".to_string()));

        let forensics = outcome.forensics.unwrap();
        assert!(forensics.success());
        assert_eq!(forensics.jobs.len(), 6);
    }

    #[tokio::test]
    async fn rejected_transfer_reverts_and_skips_analysis() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let tool = tmp.path().join("vol.py");
        std::fs::write(&tool, b"").unwrap();
        let server = server(&store).await;

        let mut machine = MockMachine::new();
        machine.expect_is_running().returning(|| Ok(true));
        machine.expect_start().never();
        machine.expect_memory_dump().never();
        machine.expect_stop().times(1).returning(|| Ok(()));
        machine.expect_revert().times(1).returning(|| Ok(()));

        let mut agent = MockAgentApi::new();
        agent.expect_health().returning(|| Ok(true));
        agent
            .expect_transfer()
            .times(1)
            .returning(|_, _| Err(Error::Transport("500 Internal Server Error".into())));
        agent.expect_begin().never();

        let mut runner = MockCommandRunner::new();
        runner.expect_run_until().never();

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            settings(),
        )
        .with_forensics(pipeline(&tool, runner))
        .run(&sample(), server, &Deadline::never())
        .await;

        match &outcome.state {
            HostState::Failed(reason) => assert!(reason.starts_with("sample transfer rejected")),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(outcome.forensics.is_none());
        assert!(outcome.memory_capture.is_none());
        assert_eq!(
            states(&outcome).iter().rev().nth(1),
            Some(&HostState::RevertingSandbox)
        );
    }

    #[tokio::test]
    async fn boot_failure_never_touches_agent_or_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let server = server(&store).await;

        let mut machine = MockMachine::new();
        machine.expect_is_running().returning(|| Ok(false));
        machine
            .expect_start()
            .times(1)
            .returning(|| Err(Error::execution("VBoxManage startvm", "exit status 1")));
        machine.expect_stop().never();
        machine.expect_revert().never();

        let mut agent = MockAgentApi::new();
        agent.expect_health().never();
        agent.expect_transfer().never();

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            settings(),
        )
        .run(&sample(), server, &Deadline::never())
        .await;

        assert!(matches!(&outcome.state, HostState::Failed(r) if r.starts_with("sandbox failed to boot")));
        assert!(tmp.path().join("abc-123").join(SESSION_SUMMARY).exists());
    }

    #[tokio::test]
    async fn unknown_machine_state_falls_back_to_agent_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let server = server(&store).await;

        let mut machine = MockMachine::new();
        machine
            .expect_is_running()
            .returning(|| Err(Error::execution("VBoxManage list runningvms", "timeout")));
        machine.expect_start().never();
        machine.expect_stop().never();
        machine.expect_revert().never();

        let mut agent = MockAgentApi::new();
        agent.expect_health().times(1).returning(|| Ok(false));

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            settings(),
        )
        .run(&sample(), server, &Deadline::never())
        .await;

        assert!(matches!(&outcome.state, HostState::Failed(r) if r.contains("list runningvms")));
    }

    #[tokio::test]
    async fn silent_agent_times_out_and_reverts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let server = server(&store).await;

        let mut machine = MockMachine::new();
        machine.expect_is_running().returning(|| Ok(true));
        machine.expect_stop().times(1).returning(|| Ok(()));
        machine.expect_revert().times(1).returning(|| Ok(()));

        let mut agent = MockAgentApi::new();
        agent
            .expect_health()
            .returning(|| Err(Error::Transport("connection refused".into())));
        agent.expect_transfer().never();

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            DriverSettings {
                agent_timeout: Duration::from_millis(60),
                ..settings()
            },
        )
        .run(&sample(), server, &Deadline::never())
        .await;

        assert!(matches!(&outcome.state, HostState::Failed(r) if r.starts_with("agent did not answer")));
    }

    #[tokio::test]
    async fn missing_finished_signal_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let server = server(&store).await;

        let mut machine = MockMachine::new();
        machine.expect_is_running().returning(|| Ok(true));
        machine.expect_memory_dump().never();
        machine.expect_stop().times(1).returning(|| Ok(()));
        machine.expect_revert().times(1).returning(|| Ok(()));

        let mut agent = MockAgentApi::new();
        agent.expect_health().returning(|| Ok(true));
        agent.expect_transfer().returning(|_, _| Ok(()));
        agent.expect_begin().returning(|s, _| Ok(s.clone()));

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            DriverSettings {
                finished_timeout: Duration::from_millis(50),
                ..settings()
            },
        )
        .run(&sample(), server, &Deadline::never())
        .await;

        assert!(matches!(&outcome.state, HostState::Failed(r) if r.starts_with("no finished signal")));
    }

    #[tokio::test]
    async fn interrupt_while_waiting_drains_and_reverts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let server = server(&store).await;

        let mut machine = MockMachine::new();
        machine.expect_is_running().returning(|| Ok(true));
        machine.expect_memory_dump().never();
        machine.expect_stop().times(1).returning(|| Ok(()));
        machine.expect_revert().times(1).returning(|| Ok(()));

        let mut agent = MockAgentApi::new();
        agent.expect_health().returning(|| Ok(true));
        agent.expect_transfer().returning(|_, _| Ok(()));
        agent.expect_begin().returning(|s, _| Ok(s.clone()));

        let interrupt = Deadline::never();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            settings(),
        )
        .run(&sample(), server, &interrupt)
        .await;

        assert_eq!(outcome.state, HostState::Failed("interrupted".to_string()));
        assert!(states(&outcome).contains(&HostState::AwaitingFinished));
    }

    /// Takes a while to boot and counts clean-up calls.
    #[derive(Default)]
    struct SlowBoot {
        stops: AtomicUsize,
        reverts: AtomicUsize,
    }

    #[async_trait]
    impl Machine for SlowBoot {
        async fn start(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            Ok(())
        }

        async fn revert(&self) -> Result<()> {
            self.reverts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self) -> Result<bool> {
            Ok(false)
        }

        async fn info(&self) -> Result<String> {
            Ok(String::new())
        }

        async fn memory_dump(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn interrupt_during_boot_still_reverts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path()));
        let server = server(&store).await;
        let machine = Arc::new(SlowBoot::default());

        let mut agent = MockAgentApi::new();
        agent.expect_health().never();
        agent.expect_transfer().never();
        agent.expect_begin().never();

        let interrupt = Deadline::never();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = SessionDriver::new(
            session(),
            descriptor(),
            Arc::clone(&machine) as Arc<dyn Machine>,
            Arc::new(agent),
            store,
            settings(),
        )
        .run(&sample(), server, &interrupt)
        .await;

        assert_eq!(outcome.state, HostState::Failed("interrupted".to_string()));
        assert!(states(&outcome).contains(&HostState::RevertingSandbox));
        assert_eq!(machine.stops.load(Ordering::SeqCst), 1);
        assert_eq!(machine.reverts.load(Ordering::SeqCst), 1);
    }

    /// Forensic modules that only end when their deadline fires. The operator
    /// interrupts as soon as the first one starts.
    struct InterruptedModules {
        operator: Deadline,
    }

    #[async_trait]
    impl CommandRunner for InterruptedModules {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            Err(Error::execution(spec.to_string(), "unbounded run"))
        }

        async fn run_until(&self, _: &CommandSpec, deadline: &Deadline) -> Result<CommandOutput> {
            self.operator.cancel();
            Ok(CommandOutput::cancelled(deadline.cancelled().await))
        }
    }

    #[tokio::test]
    async fn interrupt_reaches_forensic_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::on_disk(tmp.path().join("results")));
        let tool = tmp.path().join("vol.py");
        std::fs::write(&tool, b"").unwrap();
        let server = server(&store).await;
        let host_url = format!("http://{}", server.local_addr());

        let interrupt = Deadline::never();

        let mut machine = MockMachine::new();
        machine.expect_is_running().returning(|| Ok(true));
        machine.expect_memory_dump().times(1).returning(|path| {
            std::fs::write(path, b"core").unwrap();
            Ok(())
        });
        machine.expect_stop().times(1).returning(|| Ok(()));
        machine.expect_revert().times(1).returning(|| Ok(()));

        let mut agent = MockAgentApi::new();
        agent.expect_health().returning(|| Ok(true));
        agent.expect_transfer().returning(|_, _| Ok(()));
        agent.expect_begin().times(1).returning(move |requested, _| {
            let id = requested.clone();
            let client =
                HostClient::new(&host_url, Duration::from_secs(2), Duration::from_secs(2))
                    .unwrap();
            tokio::spawn(async move {
                client.finished(&id).await.unwrap();
            });
            Ok(requested.clone())
        });

        let config = ForensicsConfig {
            enabled: true,
            interpreter: "python2.7".to_string(),
            tool_path: tool.display().to_string(),
            timeout_secs: 600,
        };
        let driver = SessionDriver::new(
            session(),
            descriptor(),
            Arc::new(machine),
            Arc::new(agent),
            store,
            settings(),
        )
        .with_forensics(ForensicPipeline::new(
            &config,
            Arc::new(InterruptedModules {
                operator: interrupt.clone(),
            }),
        ));

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            driver.run(&sample(), server, &interrupt),
        )
        .await
        .unwrap();

        assert!(outcome.succeeded(), "{:?}", outcome.state);
        let forensics = outcome.forensics.unwrap();
        assert_eq!(forensics.jobs.len(), 6);
        assert!(forensics.jobs.iter().all(|j| !j.succeeded));
        assert!(forensics.errors.iter().all(|e| e.ends_with("stopped")));
    }

    #[test]
    fn sample_hash_is_computed_on_construction() {
        let sample = Sample::new("empty", Vec::new(), Some("python".into()));
        assert_eq!(
            sample.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn failed_state_serializes_with_reason() {
        let json = serde_json::to_value(HostState::Failed("interrupted".into())).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "interrupted");
        let json = serde_json::to_value(HostState::AwaitingFinished).unwrap();
        assert_eq!(json["state"], "awaiting_finished");
    }
}
