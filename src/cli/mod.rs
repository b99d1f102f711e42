pub mod agent;
pub mod analyze;
pub mod config;
pub mod memory;
pub mod paths;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandbay")]
#[command(
    author,
    version,
    about = "Malware sandbox controller and in-guest analysis agent"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "SANDBAY_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the analysis agent inside a sandbox
    Agent(agent::AgentArgs),

    /// Analyze a sample in a sandbox
    Analyze(analyze::AnalyzeArgs),

    /// Run forensic modules against an existing memory capture
    Memory(memory::MemoryArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved directory paths
    Paths,
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
