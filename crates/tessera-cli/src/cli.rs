//! CLI command definitions using clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Tessera plugin host
#[derive(Parser)]
#[command(name = "tessera-host")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load plugins and run the host loop
    Run {
        /// Host configuration file
        #[arg(short, long, env = "TESSERA_CONFIG")]
        config: Option<PathBuf>,

        /// Plugin directory, added to those in the configuration
        #[arg(short, long)]
        plugin_dir: Vec<PathBuf>,

        /// Stop after this many frames
        #[arg(short, long)]
        frames: Option<u64>,
    },

    /// Report what kind of plugin a file is
    Inspect {
        /// Library or assembly to inspect
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "tessera-host",
            "run",
            "--plugin-dir",
            "plugins",
            "--plugin-dir",
            "extra",
            "--frames",
            "10",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Run {
                plugin_dir, frames, ..
            } => {
                assert_eq!(plugin_dir, vec![PathBuf::from("plugins"), PathBuf::from("extra")]);
                assert_eq!(frames, Some(10));
            }
            Commands::Inspect { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_inspect_requires_file() {
        assert!(Cli::try_parse_from(["tessera-host", "inspect"]).is_err());
        let cli = Cli::try_parse_from(["tessera-host", "-v", "inspect", "libdemo.so"]).unwrap();
        assert!(cli.verbose);
    }
}
