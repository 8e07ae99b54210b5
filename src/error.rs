//! Error types for cloudflare-ufw-sync.
//!
//! Only [`ConfigError`] and [`ToolUnavailableError`] are allowed to end the
//! process. Everything else is recorded in a cycle's [`SyncResult`] and the
//! daemon keeps running.
//!
//! [`SyncResult`]: crate::model::SyncResult

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{IpFamily, RuleId};

/// Remote range retrieval failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request for {family} ranges failed: {message}")]
    Http { family: IpFamily, message: String },

    #[error("{family} range endpoint returned HTTP {status}")]
    Status { family: IpFamily, status: u16 },

    #[error("fetching {family} ranges timed out after {}s", .timeout.as_secs())]
    Timeout { family: IpFamily, timeout: Duration },

    #[error("Cloudflare API reported an error: {0}")]
    Api(String),

    #[error("could not parse {family} range list: {message}")]
    Parse { family: IpFamily, message: String },

    #[error("{family} range list too large: {size} bytes (max: {max} bytes)")]
    TooLarge {
        family: IpFamily,
        size: usize,
        max: usize,
    },

    #[error("provider returned no {0} ranges")]
    Empty(IpFamily),
}

/// The firewall tool cannot be invoked at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolUnavailableError {
    #[error("firewall tool '{0}' not found (is ufw installed?)")]
    NotFound(String),

    #[error("permission denied running '{tool}': {message}")]
    PermissionDenied { tool: String, message: String },
}

/// What a [`RuleStoreError`] was trying to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleIntent {
    List,
    Create(String),
    Delete(RuleId),
    Prepare(String),
}

impl fmt::Display for RuleIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleIntent::List => f.write_str("listing rules"),
            RuleIntent::Create(rule) => write!(f, "adding rule '{}'", rule),
            RuleIntent::Delete(id) => write!(f, "deleting rule '{}'", id),
            RuleIntent::Prepare(step) => write!(f, "{}", step),
        }
    }
}

/// A single rule-tool invocation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleStoreError {
    #[error("{intent} failed: {message}")]
    Rejected { intent: RuleIntent, message: String },

    #[error("{intent} timed out after {}s", .timeout.as_secs())]
    Timeout {
        intent: RuleIntent,
        timeout: Duration,
    },

    #[error("{intent}: no matching rule in the live rule set")]
    NotFound { intent: RuleIntent },

    #[error(transparent)]
    Unavailable(#[from] ToolUnavailableError),
}

impl RuleStoreError {
    /// Returns the underlying tool failure when the tool itself is unusable.
    pub fn as_unavailable(&self) -> Option<&ToolUnavailableError> {
        match self {
            RuleStoreError::Unavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid or unreadable configuration. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A backup could not be written or read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("backup error: {0}")]
pub struct BackupError(pub String);

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError(e.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError(e.to_string())
    }
}

/// A CIDR string that does not parse as a network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid CIDR '{0}'")]
pub struct InvalidCidr(pub String);

/// Errors that end a cycle (or the daemon) instead of being recorded.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ToolUnavailable(#[from] ToolUnavailableError),

    #[error("a synchronization cycle is already running")]
    Busy,
}

/// Error classification stored in `SyncResult.errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    /// A family's range list could not be fetched.
    Fetch(String),
    /// No ranges were available; the cycle was skipped instead of removing rules.
    EmptyRangeSet,
    /// The live rule set could not be read.
    ListRules(String),
    /// Policy or enable step before diffing failed.
    Prepare(String),
    /// The rule tool rejected an add or remove.
    Rejected(String),
    /// The rule tool did not answer in time.
    Timeout,
    /// The rule to remove was no longer present.
    NotFound,
    /// The pre-change backup could not be saved.
    Backup(String),
    /// A rule with another label already holds the key; carries that label.
    ForeignConflict(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Fetch(msg) => write!(f, "fetch failed: {}", msg),
            ErrorKind::EmptyRangeSet => {
                f.write_str("no IP ranges available, existing rules left untouched")
            }
            ErrorKind::ListRules(msg) => write!(f, "listing rules failed: {}", msg),
            ErrorKind::Prepare(msg) => write!(f, "firewall preparation failed: {}", msg),
            ErrorKind::Rejected(msg) => write!(f, "rejected: {}", msg),
            ErrorKind::Timeout => f.write_str("timed out"),
            ErrorKind::NotFound => f.write_str("rule not found"),
            ErrorKind::Backup(msg) => write!(f, "backup failed: {}", msg),
            ErrorKind::ForeignConflict(label) if label.is_empty() => {
                f.write_str("already held by an uncommented rule")
            }
            ErrorKind::ForeignConflict(label) => {
                write!(f, "already held by a rule labelled '{}'", label)
            }
        }
    }
}

impl From<&FetchError> for ErrorKind {
    fn from(e: &FetchError) -> Self {
        ErrorKind::Fetch(e.to_string())
    }
}

impl From<&RuleStoreError> for ErrorKind {
    fn from(e: &RuleStoreError) -> Self {
        match e {
            RuleStoreError::Rejected { message, .. } => ErrorKind::Rejected(message.clone()),
            RuleStoreError::Timeout { .. } => ErrorKind::Timeout,
            RuleStoreError::NotFound { .. } => ErrorKind::NotFound,
            RuleStoreError::Unavailable(u) => ErrorKind::Rejected(u.to_string()),
        }
    }
}
