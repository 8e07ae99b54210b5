//! Install command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::enforcer::check_root;
use crate::installer;

/// Run the install command
pub async fn run(no_enable: bool, config_path: Option<&Path>) -> Result<()> {
    check_root("systemctl")?;

    info!("Installing cloudflare-ufw-sync...");
    let config_path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    installer::install(config_path, !no_enable)?;

    Ok(())
}
