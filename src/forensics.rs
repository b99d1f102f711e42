//! Memory forensics over a captured sandbox image.
//!
//! Every module of the guest family's catalogue runs as its own task against
//! one shared deadline. Results are reported per module; the batch only
//! counts as successful when no module failed.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::concurrency::Deadline;
use crate::config::ForensicsConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};

pub const LINUX_MODULES: &[&str] = &[
    "linux_pslist",
    "linux_psaux",
    "linux_psscan",
    "linux_bash",
    "linux_netstat",
    "linux_lsmod",
];

pub const WINDOWS_MODULES: &[&str] = &[
    "pslist", "hivelist", "apihooks", "clipboard", "cmdline", "cmdscan", "connscan", "sockets",
    "sockscan", "dlllist", "envars", "filescan", "handles",
];

/// Guest operating-system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub fn modules(self) -> &'static [&'static str] {
        match self {
            Platform::Linux => LINUX_MODULES,
            Platform::Windows => WINDOWS_MODULES,
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            other => Err(Error::Config(format!(
                "no forensic catalogue for platform '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub module: String,
    pub output: PathBuf,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForensicReport {
    pub jobs: Vec<JobResult>,
    pub errors: Vec<String>,
}

impl ForensicReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    fn rejected(reason: String) -> Self {
        warn!("Memory processing not started: {}", reason);
        Self {
            jobs: Vec::new(),
            errors: vec![reason],
        }
    }
}

pub struct ForensicPipeline {
    interpreter: String,
    tool_path: PathBuf,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl ForensicPipeline {
    pub fn new(config: &ForensicsConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            tool_path: PathBuf::from(shellexpand::tilde(&config.tool_path).to_string()),
            timeout: Duration::from_secs(config.timeout_secs),
            runner,
        }
    }

    /// Run the catalogue for `platform` against `capture`. Each module writes
    /// `<capture dir>/<module>.txt`. Modules are bounded by the configured
    /// timeout and stop early when `session` fires.
    pub async fn run(
        &self,
        capture: &Path,
        platform: &str,
        profile: Option<&str>,
        session: &Deadline,
    ) -> ForensicReport {
        if !self.tool_path.exists() {
            return ForensicReport::rejected(format!(
                "can't find extraction tool at '{}'",
                self.tool_path.display()
            ));
        }
        if !capture.exists() {
            return ForensicReport::rejected(format!(
                "can't find memory capture at '{}'",
                capture.display()
            ));
        }
        let profile = match profile.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => p.to_string(),
            None => {
                return ForensicReport::rejected("no forensic profile configured".to_string());
            }
        };
        let modules = match platform.parse::<Platform>() {
            Ok(platform) => platform.modules(),
            Err(e) => return ForensicReport::rejected(e.to_string()),
        };

        let out_dir = capture.parent().unwrap_or(Path::new(".")).to_path_buf();
        let deadline = session.child_after(self.timeout);
        info!(
            "Running {} forensic modules on {} (profile {})",
            modules.len(),
            capture.display(),
            profile
        );

        let handles: Vec<_> = modules
            .iter()
            .map(|module| {
                let output = out_dir.join(format!("{}.txt", module));
                let spec = CommandSpec::new(&self.interpreter).args([
                    self.tool_path.display().to_string(),
                    format!("--profile={}", profile),
                    "-f".to_string(),
                    capture.display().to_string(),
                    module.to_string(),
                    format!("--output-file={}", output.display()),
                ]);
                let runner = Arc::clone(&self.runner);
                let deadline = deadline.clone();
                let module = module.to_string();
                tokio::spawn(async move {
                    let outcome = match runner.run_until(&spec, &deadline).await {
                        Ok(out) => out.into_result(&spec).map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if outcome.as_ref().is_err_and(Error::is_cancelled) {
                        // one module over budget takes its siblings down with it
                        deadline.cancel();
                    }
                    JobResult {
                        succeeded: outcome.is_ok(),
                        error: outcome.err().map(|e| e.to_string()),
                        module,
                        output,
                    }
                })
            })
            .collect();

        let mut report = ForensicReport::default();
        for (module, joined) in modules.iter().zip(futures::future::join_all(handles).await) {
            let job = joined.unwrap_or_else(|e| JobResult {
                module: module.to_string(),
                output: out_dir.join(format!("{}.txt", module)),
                succeeded: false,
                error: Some(format!("module task panicked: {}", e)),
            });
            if let Some(error) = &job.error {
                warn!("Forensic module {} failed: {}", job.module, error);
                report.errors.push(format!("{}: {}", job.module, error));
            }
            report.jobs.push(job);
        }

        info!(
            "Forensic processing finished: {}/{} modules succeeded",
            report.jobs.iter().filter(|j| j.succeeded).count(),
            report.jobs.len()
        );
        report
    }
}
