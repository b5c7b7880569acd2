//! `fstn` - CLI for fieldstation
//!
//! This binary runs the tracker pipeline and provides commands for
//! inspecting the outbox and forcing uploads.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use fieldstation::cli::{Cli, Command, ConfigCommand, PruneCommand, RecentCommand, StatusCommand};
use fieldstation::sources::{DecodeSource, JsonReplaySource};
use fieldstation::uploader::{HttpCollectorClient, Uploader};
use fieldstation::{init_logging, Config, Outbox, Tracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Run(run_cmd) => handle_run(config, run_cmd.replay).await,
        Command::Status(status_cmd) => handle_status(&config, &status_cmd),
        Command::Flush => handle_flush(&config).await,
        Command::Recent(recent_cmd) => handle_recent(&config, &recent_cmd),
        Command::Prune(prune_cmd) => handle_prune(&config, &prune_cmd),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

async fn handle_run(
    config: Config,
    replay: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let tracker = Arc::new(Tracker::open(&config).context("failed to open tracker")?);
    let channels = tracker.start().await.context("failed to start tracker")?;

    // Wire up the decode source: an explicit --replay wins over the
    // configured one
    let replay_path = replay.or_else(|| config.decode.replay_path.clone());
    let mut source = replay_path.map(JsonReplaySource::new);
    if let Some(source) = source.as_mut() {
        source
            .start(channels.decodes.clone())
            .context("failed to start decode source")?;
    }

    println!("fieldstation running (ctrl-c to stop)");
    if config.broadcast.enabled {
        println!("  Subscriber stream: {}", config.broadcast_addr());
    }
    if config.control.enabled {
        println!("  Control channel:   {}", config.control_addr());
    }
    println!("  Outbox:            {}", config.database_path().display());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    if let Some(source) = source.as_mut() {
        let _ = source.stop();
    }
    tracker.stop();
    println!("stopped");
    Ok(())
}

fn handle_status(config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let outbox = Outbox::open(config.database_path()).context("failed to open outbox")?;
    let stats = outbox.stats(None)?;

    if cmd.json {
        let status = serde_json::json!({
            "database_path": config.database_path(),
            "outbox": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("fieldstation status");
        println!("-------------------");
        println!("Database:         {}", config.database_path().display());
        println!("Total decodes:    {}", stats.total);
        println!("Uploaded:         {}", stats.uploaded);
        println!("Pending upload:   {}", stats.pending);
        println!("Unique callsigns: {}", stats.unique_callsigns);
        println!(
            "Bands seen:       {}",
            if stats.bands_seen.is_empty() {
                "none".to_string()
            } else {
                stats.bands_seen.join(", ")
            }
        );
    }
    Ok(())
}

async fn handle_flush(config: &Config) -> anyhow::Result<()> {
    if config.uploader.server_url.is_empty() {
        bail!("no collector server_url configured");
    }

    let outbox = Arc::new(Outbox::open(config.database_path()).context("failed to open outbox")?);
    let pending = outbox.stats(None)?.pending;
    if pending == 0 {
        println!("Nothing to upload.");
        return Ok(());
    }

    println!("Uploading {pending} pending decodes...");
    let client = Arc::new(HttpCollectorClient::new(&config.uploader)?);
    let uploader = Uploader::new(
        Arc::clone(&outbox),
        client,
        &config.uploader,
        config.station.id.clone(),
    );

    // Keep flushing until the backlog is drained or a batch fails
    loop {
        if !uploader.force_upload().await {
            bail!("upload failed; records remain queued");
        }
        if outbox.stats(None)?.pending == 0 {
            break;
        }
    }

    println!("Done. {pending} decodes uploaded.");
    Ok(())
}

fn handle_recent(config: &Config, cmd: &RecentCommand) -> anyhow::Result<()> {
    let outbox = Outbox::open(config.database_path()).context("failed to open outbox")?;
    let records = outbox.recent(cmd.limit)?;

    if records.is_empty() {
        println!("No decodes recorded.");
        return Ok(());
    }

    for record in records {
        let marker = if record.uploaded { " " } else { "*" };
        println!("{}{} {}", marker, record.id, record.event.display_line());
    }
    println!("(* = pending upload)");
    Ok(())
}

fn handle_prune(config: &Config, cmd: &PruneCommand) -> anyhow::Result<()> {
    let outbox = Outbox::open(config.database_path()).context("failed to open outbox")?;
    let days = cmd.days.unwrap_or(config.outbox.retention_days);

    let deleted = outbox.cleanup(days)?;
    println!("Deleted {deleted} uploaded records older than {days} days.");
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Station]");
                println!("  Id:                {}", config.station.id);
                println!();
                println!("[Outbox]");
                println!("  Database path:     {}", config.database_path().display());
                println!("  Retention (days):  {}", config.outbox.retention_days);
                println!();
                println!("[Broadcast]");
                println!("  Enabled:           {}", config.broadcast.enabled);
                println!("  Listener:          {}", config.broadcast_addr());
                println!("  Queue capacity:    {}", config.broadcast.queue_capacity);
                println!();
                println!("[Control]");
                println!("  Enabled:           {}", config.control.enabled);
                println!("  Listener:          {}", config.control_addr());
                println!();
                println!("[Uploader]");
                println!("  Enabled:           {}", config.uploader.enabled);
                println!("  Server:            {}", config.uploader.server_url);
                println!(
                    "  Interval (secs):   {}",
                    config.uploader.upload_interval_secs
                );
                println!("  Batch size:        {}", config.uploader.batch_size);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => {
                    println!("Configuration error: {e}");
                    bail!("configuration is invalid");
                }
            }
        }
    }
    Ok(())
}
