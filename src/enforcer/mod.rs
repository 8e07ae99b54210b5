//! Firewall rule stores.
//!
//! The engine only ever sees a [`RuleStore`]: list, create, delete, plus two
//! optional preparation steps. UFW is the one production implementation.

mod ufw;

use async_trait::async_trait;

pub use ufw::UfwRuleStore;

use crate::cmd_abstraction::SystemCommandRunner;
use crate::config::{DefaultPolicy, UfwConfig};
use crate::error::{RuleStoreError, ToolUnavailableError};
use crate::model::{FirewallRule, RuleId};

/// The firewall tool surface.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// List inbound allow rules, optionally only those whose label equals `label_filter`.
    async fn list(&self, label_filter: Option<&str>) -> Result<Vec<FirewallRule>, RuleStoreError>;

    /// Create an allow rule and return the handle it can later be deleted by.
    async fn create(&self, rule: &FirewallRule) -> Result<RuleId, RuleStoreError>;

    /// Delete the rule behind `id`.
    async fn delete(&self, id: &RuleId) -> Result<(), RuleStoreError>;

    /// Set the default incoming policy.
    async fn set_default_policy(&self, _policy: DefaultPolicy) -> Result<(), RuleStoreError> {
        Ok(())
    }

    /// Turn the firewall on if it is off.
    async fn ensure_enabled(&self) -> Result<(), RuleStoreError> {
        Ok(())
    }
}

/// Build the production rule store from configuration
pub fn create_rule_store(config: &UfwConfig) -> Box<dyn RuleStore> {
    Box::new(UfwRuleStore::new(
        config.binary.clone(),
        config.command_timeout(),
        SystemCommandRunner::new(),
    ))
}

/// Check if running as root (effective UID == 0)
///
/// ufw refuses every command, `status` included, for other users.
pub fn check_root(tool: &str) -> Result<(), ToolUnavailableError> {
    // SAFETY: geteuid() is a simple syscall that reads the effective user ID.
    // It has no preconditions, never fails, and doesn't modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(ToolUnavailableError::PermissionDenied {
            tool: tool.to_string(),
            message: "this operation requires root privileges, please run with sudo".to_string(),
        });
    }
    Ok(())
}
