//! Pre-change backups of the owned rule set.
//!
//! Each backup is one JSON file `rules-<UTC timestamp>.json` holding the
//! owned rules exactly as they were listed before a plan was applied. File
//! names sort chronologically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::BackupError;
use crate::model::FirewallRule;

const PREFIX: &str = "rules-";
const SUFFIX: &str = ".json";

/// Where a saved snapshot ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    pub path: PathBuf,
    pub rules: usize,
}

/// Destination for pre-change snapshots.
pub trait BackupSink: Send + Sync {
    fn save(&self, snapshot: &[FirewallRule]) -> Result<BackupHandle, BackupError>;
}

/// On-disk backup document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub created_at: DateTime<Utc>,
    pub rules: Vec<FirewallRule>,
}

/// Writes backups as JSON files into a directory, keeping the newest `keep`.
#[derive(Debug, Clone)]
pub struct FileBackupSink {
    dir: PathBuf,
    keep: usize,
}

impl FileBackupSink {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn prune(&self) -> Result<(), BackupError> {
        let backups = list_backups(&self.dir)?;
        for old in backups.iter().skip(self.keep) {
            debug!("Removing old backup {:?}", old);
            fs::remove_file(old)?;
        }
        Ok(())
    }
}

impl BackupSink for FileBackupSink {
    fn save(&self, snapshot: &[FirewallRule]) -> Result<BackupHandle, BackupError> {
        fs::create_dir_all(&self.dir)?;

        let mut created_at = Utc::now();
        let mut path = self.dir.join(file_name(created_at));
        while path.exists() {
            created_at += chrono::Duration::microseconds(1);
            path = self.dir.join(file_name(created_at));
        }

        let backup = Backup {
            created_at,
            rules: snapshot.to_vec(),
        };
        let content = serde_json::to_string_pretty(&backup)?;

        // tempfile + rename so a crash never leaves a truncated backup
        let mut temp_file = NamedTempFile::new_in(&self.dir)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&path)
            .map_err(|e| BackupError(format!("failed to persist {:?}: {}", path, e)))?;

        info!("Saved backup of {} rule(s) to {:?}", snapshot.len(), path);

        if let Err(e) = self.prune() {
            warn!("Failed to prune old backups: {}", e);
        }

        Ok(BackupHandle {
            path,
            rules: snapshot.len(),
        })
    }
}

fn file_name(created_at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        PREFIX,
        created_at.format("%Y%m%dT%H%M%S%.6fZ"),
        SUFFIX
    )
}

/// Backup files in `dir`, newest first. A missing directory has no backups.
pub fn list_backups(dir: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PREFIX) && n.ends_with(SUFFIX))
        })
        .collect();
    backups.sort();
    backups.reverse();
    Ok(backups)
}

/// Read a backup file.
pub fn load_backup(path: &Path) -> Result<Backup, BackupError> {
    let content = fs::read_to_string(path)
        .map_err(|e| BackupError(format!("failed to read {:?}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| BackupError(format!("failed to parse {:?}: {}", path, e)))
}
