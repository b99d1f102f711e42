use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use sandbay::concurrency::Deadline;
use sandbay::config::Config;
use sandbay::control::{AgentClient, SessionId};
use sandbay::exec::{CommandRunner, TokioRunner};
use sandbay::forensics::ForensicPipeline;
use sandbay::host::{
    ArtifactStore, CollectionServer, DriverSettings, Sample, SessionDriver, SessionOutcome,
    VirusTotal,
};
use sandbay::machine;

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Sample to analyze
    pub sample: PathBuf,

    /// Sandbox to use; required when several are configured
    #[arg(short, long)]
    pub sandbox: Option<String>,

    /// Program that launches the sample inside the guest (e.g. "python")
    #[arg(short, long)]
    pub executor: Option<String>,

    /// Skip memory forensics even when enabled in config
    #[arg(long)]
    pub no_forensics: bool,
}

pub async fn run(args: AnalyzeArgs, config: Config) -> Result<()> {
    let descriptor = config.sandbox(args.sandbox.as_deref())?.clone();
    let sample = Sample::load(&args.sample, args.executor.clone()).await?;
    let session = SessionId::new();

    let runner: Arc<dyn CommandRunner> = Arc::new(TokioRunner::new());
    let machine = machine::connect(&config.host, &descriptor, Arc::clone(&runner))?;
    let agent = AgentClient::new(
        &descriptor.address,
        Duration::from_secs(config.host.request_timeout_secs),
        Duration::from_secs(config.host.transfer_timeout_secs),
    )?;

    let store = Arc::new(ArtifactStore::on_disk(config.result_root()));
    let result_dir = store.session_dir(&session);

    let addr: SocketAddr = format!("{}:{}", config.host.bind, config.host.port)
        .parse()
        .context("Invalid host.bind / host.port")?;
    let server = CollectionServer::bind(
        addr,
        session.clone(),
        Arc::clone(&store),
        config.host.max_upload_mb.saturating_mul(1024 * 1024),
    )
    .await
    .with_context(|| format!("Failed to bind collection server on {}", addr))?;

    let mut driver = SessionDriver::new(
        session,
        descriptor,
        machine,
        Arc::new(agent),
        store,
        DriverSettings::from_config(&config.host),
    );
    if config.forensics.enabled && !args.no_forensics {
        driver = driver.with_forensics(ForensicPipeline::new(&config.forensics, runner));
    }
    if config.reputation.enabled {
        driver = driver.with_reputation(VirusTotal::new(&config.reputation)?);
    }

    let interrupt = Deadline::never();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, winding the session down. Press Ctrl-C again to abort");
            trigger.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second interrupt, aborting without revert");
            std::process::exit(130);
        }
    });

    let outcome = driver.run(&sample, server, &interrupt).await;
    print_summary(&outcome, &result_dir);

    if !outcome.succeeded() {
        anyhow::bail!("Session {} {}", outcome.session, outcome.state);
    }
    Ok(())
}

fn print_summary(outcome: &SessionOutcome, result_dir: &std::path::Path) {
    let forensics = match &outcome.forensics {
        Some(report) => format!(
            ", forensics {}/{}",
            report.jobs.iter().filter(|j| j.succeeded).count(),
            report.jobs.len()
        ),
        None => String::new(),
    };
    println!(
        "{} {} on '{}': {} ({} artifacts, {} missing{}) -> {}",
        outcome.session,
        outcome.sample,
        outcome.sandbox,
        outcome.state,
        outcome.received.len(),
        outcome.missing_artifacts.len(),
        forensics,
        result_dir.display()
    );
}
