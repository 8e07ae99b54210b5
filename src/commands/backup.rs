//! Backup command implementation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{build_orchestrator, print_result};
use crate::backup::{list_backups, load_backup};
use crate::cli::BackupAction;
use crate::config::Config;
use crate::enforcer::check_root;
use crate::lock::LockGuard;

/// Run a backup subcommand
pub async fn run(action: BackupAction, config: &Config) -> Result<()> {
    match action {
        BackupAction::List => list(config),
        BackupAction::Restore { file } => restore(file, config).await,
    }
}

fn list(config: &Config) -> Result<()> {
    let dir = &config.backup.dir;
    let backups = list_backups(dir).with_context(|| format!("Failed to read {:?}", dir))?;

    println!();
    if backups.is_empty() {
        println!("No backups in {}", dir.display());
        println!();
        return Ok(());
    }

    println!("Backups in {} (newest first):", dir.display());
    for path in &backups {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match load_backup(path) {
            Ok(backup) => {
                let local: chrono::DateTime<chrono::Local> = backup.created_at.into();
                println!(
                    "  {}  {}  {} rule(s)",
                    name,
                    local.format("%Y-%m-%d %H:%M:%S"),
                    backup.rules.len()
                );
            }
            Err(e) => println!("  {}  unreadable: {}", name, e),
        }
    }
    println!();
    Ok(())
}

fn newest_backup(dir: &Path) -> Result<PathBuf> {
    list_backups(dir)
        .with_context(|| format!("Failed to read {:?}", dir))?
        .into_iter()
        .next()
        .with_context(|| format!("No backups found in {:?}", dir))
}

async fn restore(file: Option<PathBuf>, config: &Config) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => newest_backup(&config.backup.dir)?,
    };
    let backup = load_backup(&path).with_context(|| format!("Failed to load {:?}", path))?;

    let owned = backup
        .rules
        .iter()
        .filter(|r| r.label == config.ufw.label)
        .count();
    if owned == 0 {
        anyhow::bail!(
            "Backup {:?} holds no rules labelled '{}', refusing to remove every managed rule",
            path,
            config.ufw.label
        );
    }
    if owned < backup.rules.len() {
        warn!(
            "Ignoring {} rule(s) in the backup with a different label",
            backup.rules.len() - owned
        );
    }

    check_root(&config.ufw.binary)?;
    let lock = LockGuard::acquire(&config.lock_file)?;
    debug!("Holding lock {:?}", lock.path());

    info!("Restoring {:?}", path);
    let orchestrator = build_orchestrator(config)?;
    let result = orchestrator.restore(&backup.rules).await?;
    print_result(&result);
    Ok(())
}
