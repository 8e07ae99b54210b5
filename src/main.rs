//! cloudflare-ufw-sync - keep UFW allow rules in step with Cloudflare's IP ranges.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, Layer};

use cloudflare_ufw_sync::cli::{Cli, Commands};
use cloudflare_ufw_sync::commands;
use cloudflare_ufw_sync::config::{Config, LoggingConfig};
use cloudflare_ufw_sync::error::ConfigError;

/// Console output plus an optional append-only log file.
fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Result<()> {
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else if cli.quiet {
        LevelFilter::ERROR
    } else {
        LevelFilter::from_str(&logging.level).unwrap_or(LevelFilter::INFO)
    };

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .with_filter(level);

    // A log file that cannot be opened must not prevent the tool from running
    let mut file_error = None;
    let file = logging.file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(level),
            ),
            Err(e) => {
                file_error = Some(format!("Cannot open log file {:?}: {}", path, e));
                None
            }
        }
    });

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(msg) = file_error {
        warn!("{}", msg);
    }
    Ok(())
}

fn require(loaded: Result<(Config, Option<PathBuf>), ConfigError>) -> Result<Config> {
    let (config, _) = loaded.context("Failed to load configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings live in the config, so load it before the subscriber
    let loaded = Config::discover(cli.config.as_deref());
    let logging = loaded
        .as_ref()
        .map(|(config, _)| config.logging.clone())
        .unwrap_or_default();
    init_logging(&cli, &logging)?;

    match &loaded {
        Ok((_, Some(path))) => debug!("Using configuration {:?}", path),
        Ok((_, None)) => warn!("No configuration file found, using defaults"),
        Err(_) => {}
    }

    match cli.command {
        Commands::Version => {
            println!("cloudflare-ufw-sync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Install { no_enable } => {
            commands::install::run(no_enable, cli.config.as_deref()).await
        }
        Commands::Uninstall => commands::uninstall::run().await,
        Commands::Sync { dry_run } => commands::sync::run(dry_run, &require(loaded)?).await,
        Commands::Daemon => commands::daemon::run(&require(loaded)?).await,
        Commands::Status => commands::status::run(&require(loaded)?).await,
        Commands::Backup { action } => commands::backup::run(action, &require(loaded)?).await,
    }
}
