//! # cloudflare-ufw-sync
//!
//! Keeps a set of UFW allow rules equal to the cross product of Cloudflare's
//! published IP ranges and a list of configured ports.
//!
//! ## Guarantees
//!
//! - **Owned rules only** - rules are owned when their UFW comment equals the
//!   configured label; nothing else is ever modified
//! - **Never empty** - a fetch that yields no ranges (or fails for any family)
//!   leaves the current rules in place
//! - **Idempotent** - a cycle against an unchanged range list applies nothing
//! - **Isolated failures** - one rejected rule does not stop the rest of the plan
//! - **Backed up** - owned rules are saved as JSON before every change
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap): sync, daemon, status, backup, install ...      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SyncOrchestrator                                           │
//! │    fetch ──▶ reconcile ──▶ execute ──▶ record               │
//! ├───────────────┬──────────────────┬──────────────────────────┤
//! │ RangeFetcher  │ Reconciler       │ RuleExecutor             │
//! │ (reqwest)     │ (pure diff)      │ RuleStore + BackupSink   │
//! ├───────────────┴──────────────────┼──────────────────────────┤
//! │                                  │ UfwRuleStore             │
//! │                                  │ (CommandRunner, tokio)   │
//! └──────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use cloudflare_ufw_sync::backup::FileBackupSink;
//! use cloudflare_ufw_sync::config::Config;
//! use cloudflare_ufw_sync::enforcer::{check_root, create_rule_store};
//! use cloudflare_ufw_sync::fetcher::CloudflareFetcher;
//! use cloudflare_ufw_sync::orchestrator::{CycleSettings, SyncOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/cloudflare-ufw-sync/config.yaml")?;
//!     check_root(&config.ufw.binary)?;
//!
//!     let orchestrator = SyncOrchestrator::new(
//!         CycleSettings::from_config(&config),
//!         Box::new(CloudflareFetcher::new(&config.cloudflare)?),
//!         create_rule_store(&config.ufw),
//!         Box::new(FileBackupSink::new(&config.backup.dir, config.backup.keep)),
//!     );
//!
//!     let result = orchestrator.run_once().await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`backup`] - Pre-change rule backups and retention
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Bounded-time external command execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`enforcer`] - Rule store abstraction and the UFW implementation
//! - [`error`] - Error types
//! - [`executor`] - Applies change plans
//! - [`fetcher`] - Cloudflare range download and parsing
//! - [`installer`] - systemd unit installation
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`model`] - Ranges, rules, plans and results
//! - [`orchestrator`] - Cycle driver and daemon loop
//! - [`reconciler`] - Desired-versus-current diff
//! - [`signal`] - Shutdown and manual trigger signal handling
//! - [`state`] - Persisted status for `status`
//! - [`utils`] - Formatting helpers

pub mod backup;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod installer;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod reconciler;
pub mod signal;
pub mod state;
pub mod utils;

pub use config::Config;
pub use orchestrator::SyncOrchestrator;
