use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use sandbay::concurrency::Deadline;
use sandbay::config::Config;
use sandbay::exec::TokioRunner;
use sandbay::forensics::ForensicPipeline;

#[derive(Args)]
pub struct MemoryArgs {
    /// Memory capture to process
    pub capture: PathBuf,

    /// Sandbox whose platform and profile apply
    #[arg(short, long)]
    pub sandbox: Option<String>,

    /// Guest OS family (linux or windows), overriding the sandbox's
    #[arg(long)]
    pub platform: Option<String>,

    /// Forensic profile, overriding the sandbox's
    #[arg(long)]
    pub profile: Option<String>,
}

pub async fn run(args: MemoryArgs, config: Config) -> Result<()> {
    let (platform, profile) = match (args.platform, args.profile) {
        (Some(platform), Some(profile)) => (platform, Some(profile)),
        (platform, profile) => {
            let sandbox = config.sandbox(args.sandbox.as_deref())?;
            (
                platform.unwrap_or_else(|| sandbox.platform.clone()),
                profile.or_else(|| sandbox.profile.clone()),
            )
        }
    };

    let interrupt = Deadline::never();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping forensic modules");
            trigger.cancel();
        }
    });

    let pipeline = ForensicPipeline::new(&config.forensics, Arc::new(TokioRunner::new()));
    let report = pipeline
        .run(&args.capture, &platform, profile.as_deref(), &interrupt)
        .await;

    for job in &report.jobs {
        println!(
            "{:<16} {:<6} {}",
            job.module,
            if job.succeeded { "ok" } else { "failed" },
            job.output.display()
        );
    }
    for error in &report.errors {
        eprintln!("error: {}", error);
    }

    if !report.success() {
        anyhow::bail!("{} forensic error(s)", report.errors.len());
    }
    Ok(())
}
