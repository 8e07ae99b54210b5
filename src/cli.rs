//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cloudflare-ufw-sync")]
#[command(author, version, about = "Keep UFW allow rules in sync with Cloudflare's IP ranges")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (default: first of the usual locations that exists)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one synchronization cycle
    Sync {
        /// Fetch ranges and print the plan without changing any rule
        #[arg(long)]
        dry_run: bool,
    },

    /// Synchronize periodically until stopped (SIGHUP forces a cycle)
    Daemon,

    /// Show the last sync result and the live managed rules
    Status,

    /// Inspect or restore pre-change rule backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Install the systemd service and a default config
    Install {
        /// Write the unit but do not enable or start it
        #[arg(long)]
        no_enable: bool,
    },

    /// Remove the systemd service
    Uninstall,

    /// Show version
    Version,
}

#[derive(Subcommand)]
pub enum BackupAction {
    /// List backups, newest first
    List,

    /// Reconcile the managed rules back to a backup (default: newest)
    Restore {
        /// Backup file to restore
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses_help() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_version_command() {
        let cli = Cli::try_parse_from(["cloudflare-ufw-sync", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_cli_sync_command() {
        let cli = Cli::try_parse_from(["cloudflare-ufw-sync", "sync"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { dry_run: false }));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["cloudflare-ufw-sync", "sync", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { dry_run: true }));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cloudflare-ufw-sync",
            "daemon",
            "--config",
            "/tmp/config.yaml",
            "-v",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Daemon));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/config.yaml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["cloudflare-ufw-sync", "status", "-q", "-v"]).is_err());
    }

    #[test]
    fn test_cli_backup_restore() {
        let cli = Cli::try_parse_from(["cloudflare-ufw-sync", "backup", "restore"]).unwrap();
        match cli.command {
            Commands::Backup {
                action: BackupAction::Restore { file },
            } => assert!(file.is_none()),
            _ => panic!("Expected backup restore"),
        }

        let cli = Cli::try_parse_from([
            "cloudflare-ufw-sync",
            "backup",
            "restore",
            "/var/lib/cloudflare-ufw-sync/backups/rules.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup {
                action: BackupAction::Restore { file },
            } => assert!(file.is_some()),
            _ => panic!("Expected backup restore"),
        }
    }

    #[test]
    fn test_cli_install_no_enable() {
        let cli = Cli::try_parse_from(["cloudflare-ufw-sync", "install", "--no-enable"]).unwrap();
        assert!(matches!(cli.command, Commands::Install { no_enable: true }));
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["cloudflare-ufw-sync", "update"]).is_err());
    }
}
