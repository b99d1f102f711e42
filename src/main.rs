use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands};
use sandbay::config::{Config, LoggingConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let Cli {
        command,
        verbose,
        config,
    } = cli;
    let file = config.as_deref().map(Path::new);

    match command {
        Commands::Config(args) => {
            init_logging(None, verbose);
            cli::config::run(args, file)
        }
        Commands::Paths => {
            init_logging(None, verbose);
            cli::paths::run(file)
        }
        Commands::Agent(args) => cli::agent::run(args, load_config(file, verbose)?).await,
        Commands::Analyze(args) => cli::analyze::run(args, load_config(file, verbose)?).await,
        Commands::Memory(args) => cli::memory::run(args, load_config(file, verbose)?).await,
    }
}

fn load_config(file: Option<&Path>, verbose: bool) -> Result<Config> {
    let config = Config::load_from(file)?;
    init_logging(Some(&config.logging), verbose);
    Ok(config)
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level`.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        logging.map_or("info", |l| l.level.as_str())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.is_some_and(|l| l.format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}
