//! posa - operator CLI for the offline layer.
//!
//! CLI entry point that dispatches to subcommands.

use std::process::ExitCode;

use clap::Parser;
use console::style;
use posa_core::AppConfig;
use tracing_subscriber::EnvFilter;

mod args;
mod commands;
mod prompt;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 0 = warn, 1 = info, 2+ = debug; RUST_LOG wins when set
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let config = AppConfig::load_from(cli.config.as_deref())?;
    tracing::debug!(data_dir = %config.data_dir.display(), origin = %config.origin, "configuration loaded");

    match cli.command {
        Commands::Sync(args) => commands::sync(args, &config).await,
        Commands::Persist(args) => commands::persist(args, &config).await,
        Commands::Lookup(args) => commands::lookup(args, &config).await,
        Commands::Fetch(args) => commands::fetch(args, &config).await,
        Commands::Queues(args) => commands::queues(args, &config).await,
        Commands::Version => commands::version(&config).await,
        Commands::Purge(args) => commands::purge(args, &config).await,
    }
}
