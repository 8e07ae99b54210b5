//! Persisted status so `status` can report on a daemon running elsewhere.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::model::SyncResult;

/// Durable summary of recent cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStatus {
    pub last_result: Option<SyncResult>,
    /// Cycles in a row that recorded at least one error
    #[serde(default)]
    pub consecutive_error_cycles: u32,
    /// Cycles completed since the state file was created
    #[serde(default)]
    pub total_cycles: u64,
}

impl PersistedStatus {
    /// Load state from file; a missing file is an empty state
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Save state to file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;

        let content = serde_json::to_string_pretty(self)?;
        let mut temp_file = NamedTempFile::new_in(parent)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist state file: {:?}", path))?;
        Ok(())
    }

    /// Fold a finished cycle into the state
    pub fn record(&mut self, result: &SyncResult) {
        if result.is_clean() {
            self.consecutive_error_cycles = 0;
        } else {
            self.consecutive_error_cycles += 1;
        }
        self.total_cycles += 1;
        self.last_result = Some(result.clone());
    }

    /// Load, record and save in one step
    pub fn update(path: &Path, result: &SyncResult) -> Result<Self> {
        // A corrupt state file is replaced rather than blocking status updates
        let mut state = Self::load(path).unwrap_or_default();
        state.record(result);
        state.save(path)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::CycleError;
    use chrono::Utc;

    fn result(errors: usize) -> SyncResult {
        SyncResult::skipped(
            Utc::now(),
            (0..errors)
                .map(|_| CycleError::cycle(ErrorKind::EmptyRangeSet))
                .collect(),
        )
    }

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistedStatus::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, PersistedStatus::default());
    }

    #[test]
    fn test_record_counts_error_streak() {
        let mut state = PersistedStatus::default();
        state.record(&result(1));
        state.record(&result(2));
        assert_eq!(state.consecutive_error_cycles, 2);
        state.record(&result(0));
        assert_eq!(state.consecutive_error_cycles, 0);
        assert_eq!(state.total_cycles, 3);
    }

    #[test]
    fn test_update_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        PersistedStatus::update(&path, &result(1)).unwrap();
        let state = PersistedStatus::update(&path, &result(1)).unwrap();
        assert_eq!(state.consecutive_error_cycles, 2);

        let loaded = PersistedStatus::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_update_replaces_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "garbage").unwrap();

        assert!(PersistedStatus::load(&path).is_err());
        let state = PersistedStatus::update(&path, &result(0)).unwrap();
        assert_eq!(state.total_cycles, 1);
    }
}
