//! Command-line interface for fieldstation.
//!
//! This module provides the CLI structure and command definitions for the
//! `fstn` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, PruneCommand, RecentCommand, RunCommand, StatusCommand};

/// fstn - Mobile field-station telemetry pipeline
///
/// Receives decode events from a radio decoder, enriches them with position
/// and band, streams them to local display clients, and queues them for
/// upload to a remote collector whenever connectivity exists.
#[derive(Debug, Parser)]
#[command(name = "fstn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the tracker pipeline in the foreground
    Run(RunCommand),

    /// Show pipeline and outbox status
    Status(StatusCommand),

    /// Run one upload cycle now, outside the schedule
    Flush,

    /// Show the most recent decodes
    Recent(RecentCommand),

    /// Delete uploaded records past the retention horizon
    Prune(PruneCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
