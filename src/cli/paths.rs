//! CLI subcommand: `sandbay paths`
//!
//! Prints the resolved directories for debugging and scripting.

use anyhow::Result;
use std::path::Path;

use sandbay::config::Config;
use sandbay::paths::Paths;

pub fn run(file: Option<&Path>) -> Result<()> {
    let paths = Paths::resolve()?;

    println!("Sandbay Paths (XDG Base Directory)");
    println!("==================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    match file {
        Some(file) => println!("  config.toml:    {} (override)", file.display()),
        None => println!("  config.toml:    {}", paths.config_file().display()),
    }
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  results:        {}", paths.results_dir().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  logs:           {}", paths.logs_dir().display());

    let config_file = file.map_or_else(|| paths.config_file(), Path::to_path_buf);
    if config_file.exists()
        && let Ok(config) = Config::load_from(file)
        && config.result_root() != paths.results_dir()
    {
        println!();
        println!("host.result_dir overrides results: {}", config.result_root().display());
    }

    Ok(())
}
