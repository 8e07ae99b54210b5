//! File-based locking to keep one process mutating the firewall at a time.
//!
//! The in-process gate in the orchestrator serializes cycles inside one
//! process; this advisory flock does the same across a daemon and a manual
//! `sync` or `backup restore` started from a shell.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Holds an exclusive lock on the lock file until dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Attempt to acquire an exclusive lock on `path` without blocking.
    ///
    /// The file is opened create+read+write without truncation so there is
    /// no window between creating it and locking it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another cloudflare-ufw-sync process is already running (lock: {:?}).\n\
                 Wait for it to finish, or stop the daemon first.",
                path
            )
        })?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
