//! Command argument definitions for the `fstn` binary.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Arguments for the `run` command.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Replay decode events from a JSON-lines file instead of the
    /// configured source
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,
}

/// Arguments for the `status` command.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output status as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `recent` command.
#[derive(Debug, Args)]
pub struct RecentCommand {
    /// Maximum number of decodes to show
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,
}

/// Arguments for the `prune` command.
#[derive(Debug, Args)]
pub struct PruneCommand {
    /// Retention horizon in days (defaults to the configured value)
    #[arg(long, value_name = "DAYS")]
    pub days: Option<u32>,
}

/// Configuration subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Output configuration as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the configuration file path
    Path,
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate (defaults to the standard path)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}
