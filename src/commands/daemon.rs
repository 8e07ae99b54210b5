//! Daemon command implementation.

use anyhow::Result;
use tracing::{debug, info};

use super::build_orchestrator;
use crate::config::Config;
use crate::enforcer::check_root;
use crate::lock::LockGuard;
use crate::signal::{install_signal_handlers, ShutdownToken};

/// Run the daemon command until SIGINT or SIGTERM
pub async fn run(config: &Config) -> Result<()> {
    if !config.sync.enabled {
        anyhow::bail!("Synchronization is disabled (sync.enabled: false)");
    }

    check_root(&config.ufw.binary)?;
    let lock = LockGuard::acquire(&config.lock_file)?;
    debug!("Holding lock {:?}", lock.path());

    let orchestrator = build_orchestrator(config)?;
    let token = ShutdownToken::new();
    install_signal_handlers(token.clone(), orchestrator.trigger_handle());

    info!(
        "Managing rules labelled '{}' for {} port(s)",
        orchestrator.settings().label,
        orchestrator.settings().ports.len()
    );
    orchestrator.run_daemon(config.interval(), token).await?;

    Ok(())
}
