//! Tessera host - loads plugin libraries, ticks them and reloads them on change

mod cli;
mod commands;
mod config;

use clap::Parser;
use cli::{Cli, Commands, LogFormat};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over the verbosity flag
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    match cli.command {
        Commands::Run {
            config,
            plugin_dir,
            frames,
        } => commands::run::run(config.as_deref(), &plugin_dir, frames),
        Commands::Inspect { file } => commands::inspect::run(&file),
    }
}
