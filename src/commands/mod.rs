//! CLI command implementations.

pub mod backup;
pub mod daemon;
pub mod install;
pub mod status;
pub mod sync;
pub mod uninstall;

use anyhow::{Context, Result};
use tracing::debug;

use crate::backup::FileBackupSink;
use crate::config::Config;
use crate::enforcer::create_rule_store;
use crate::fetcher::CloudflareFetcher;
use crate::model::SyncResult;
use crate::orchestrator::{CycleSettings, SyncOrchestrator};

/// Wire the production fetcher, rule store and backup sink together
pub fn build_orchestrator(config: &Config) -> Result<SyncOrchestrator> {
    let fetcher =
        CloudflareFetcher::new(&config.cloudflare).context("Failed to create HTTP client")?;

    let backups = FileBackupSink::new(&config.backup.dir, config.backup.keep);
    debug!("Pre-change backups go to {}", backups.dir().display());

    Ok(SyncOrchestrator::new(
        CycleSettings::from_config(config),
        Box::new(fetcher),
        create_rule_store(&config.ufw),
        Box::new(backups),
    )
    .with_state_file(&config.state_file))
}

/// Print a cycle result for interactive use
fn print_result(result: &SyncResult) {
    println!();
    if result.is_clean() {
        println!("[OK] {}", result.summary());
    } else {
        println!("[WARN] {}", result.summary());
        for err in &result.errors {
            println!("  - {}", err);
        }
    }
    println!(
        "Ranges: {} IPv4, {} IPv6",
        result.ranges.v4, result.ranges.v6
    );
    println!();
}
