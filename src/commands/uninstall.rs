//! Uninstall command implementation.

use anyhow::Result;

use crate::enforcer::check_root;
use crate::installer;

/// Run the uninstall command
pub async fn run() -> Result<()> {
    check_root("systemctl")?;
    installer::uninstall()
}
