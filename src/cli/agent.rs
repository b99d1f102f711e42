use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use sandbay::agent::AgentServer;
use sandbay::config::Config;
use sandbay::control::HostClient;
use sandbay::exec::TokioRunner;

use super::shutdown_signal;

#[derive(Args)]
pub struct AgentArgs {
    /// Address to listen on (overrides agent.bind)
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides agent.port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// URL of the host collection server (overrides agent.host_url)
    #[arg(long)]
    pub host_url: Option<String>,

    /// Directory the sample and task outputs are staged in
    #[arg(long)]
    pub staging_dir: Option<String>,
}

pub async fn run(args: AgentArgs, config: Config) -> Result<()> {
    let mut agent = config.agent;
    if let Some(bind) = args.bind {
        agent.bind = bind;
    }
    if let Some(port) = args.port {
        agent.port = port;
    }
    if let Some(host_url) = args.host_url {
        agent.host_url = host_url;
    }
    if let Some(staging_dir) = args.staging_dir {
        agent.staging_dir = staging_dir;
    }

    let staging = agent.staging_path();
    tokio::fs::create_dir_all(&staging)
        .await
        .with_context(|| format!("Failed to create staging dir {}", staging.display()))?;

    let reporter = HostClient::new(
        &agent.host_url,
        Duration::from_secs(agent.report_timeout_secs),
        Duration::from_secs(agent.upload_timeout_secs),
    )
    .context("Failed to build host client")?;
    info!(
        "Reporting to {}, staging in {}",
        reporter.base_url(),
        staging.display()
    );

    AgentServer::new(&agent, Arc::new(TokioRunner::new()), Arc::new(reporter))
        .run(shutdown_signal())
        .await
}
