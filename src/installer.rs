//! Installation and removal of the systemd service.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::config::Config;

const SERVICE_NAME: &str = "cloudflare-ufw-sync.service";
const SYSTEMD_SERVICE: &str = "/etc/systemd/system/cloudflare-ufw-sync.service";
const STATE_DIR: &str = "/var/lib/cloudflare-ufw-sync";
const DEFAULT_BINARY: &str = "/usr/local/bin/cloudflare-ufw-sync";

/// Reject paths that would break out of an `ExecStart=` line
fn validate_unit_path(path: &Path) -> Result<()> {
    let s = path
        .to_str()
        .with_context(|| format!("Path {:?} is not valid UTF-8", path))?;

    if !path.is_absolute() {
        anyhow::bail!("Path '{}' must be absolute", s);
    }
    if s.chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '\\' | '$' | '%' | ';'))
    {
        anyhow::bail!(
            "Path '{}' contains characters that cannot be used in a systemd unit",
            s
        );
    }
    Ok(())
}

/// Install the service unit, creating the config file if it is missing.
///
/// With `enable` the service is enabled at boot and started right away.
pub fn install(config_path: &Path, enable: bool) -> Result<()> {
    let binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(DEFAULT_BINARY));
    validate_unit_path(&binary)?;
    validate_unit_path(config_path)?;

    if config_path.exists() {
        info!("Keeping existing configuration at {:?}", config_path);
        Config::load(config_path)
            .with_context(|| format!("Existing configuration {:?} is invalid", config_path))?;
    } else {
        let dir = config_path.parent().unwrap_or(Path::new("/"));
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        info!("Creating {:?}...", config_path);
        fs::write(config_path, Config::generate_default_yaml())
            .context("Failed to write config file")?;
        fs::set_permissions(config_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set config permissions")?;
    }

    fs::create_dir_all(STATE_DIR).context("Failed to create state directory")?;
    fs::set_permissions(STATE_DIR, fs::Permissions::from_mode(0o700))
        .context("Failed to set state directory permissions")?;

    info!("Creating {}...", SYSTEMD_SERVICE);
    fs::write(SYSTEMD_SERVICE, generate_service_unit(&binary, config_path))
        .context("Failed to write systemd service")?;

    systemctl(&["daemon-reload"])?;

    if enable {
        info!("Enabling and starting {}...", SERVICE_NAME);
        systemctl(&["enable", "--now", SERVICE_NAME])?;
    }

    println!();
    println!("[OK] Installation complete!");
    println!();
    println!("Next steps:");
    println!("  1. Review configuration: {}", config_path.display());
    if enable {
        println!("  2. Check status: cloudflare-ufw-sync status");
    } else {
        println!("  2. Start the service: systemctl enable --now {}", SERVICE_NAME);
    }
    println!();

    Ok(())
}

/// Stop and remove the service unit.
///
/// Configuration, backups and the UFW rules themselves are left in place.
pub fn uninstall() -> Result<()> {
    info!("Uninstalling {}...", SERVICE_NAME);

    // Either may fail when the unit was never enabled
    if let Err(e) = systemctl(&["disable", "--now", SERVICE_NAME]) {
        warn!("{}", e);
    }

    if Path::new(SYSTEMD_SERVICE).exists() {
        info!("Removing {}...", SYSTEMD_SERVICE);
        fs::remove_file(SYSTEMD_SERVICE)
            .with_context(|| format!("Failed to remove {}", SYSTEMD_SERVICE))?;
    }

    if let Err(e) = systemctl(&["daemon-reload"]) {
        warn!("{}", e);
    }

    println!();
    println!("[OK] Service removed.");
    println!();
    println!("Note: UFW rules, configuration and backups were kept.");
    println!("      Remove labelled rules with 'ufw status numbered' and 'ufw delete'.");
    println!();

    Ok(())
}

fn systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl")
        .args(args)
        .status()
        .with_context(|| format!("Failed to run systemctl {}", args.join(" ")))?;
    if !status.success() {
        anyhow::bail!("systemctl {} exited with {}", args.join(" "), status);
    }
    Ok(())
}

/// Generate the systemd service unit
fn generate_service_unit(binary: &Path, config_path: &Path) -> String {
    format!(
        r#"[Unit]
Description=Cloudflare IP range sync for UFW
After=network-online.target ufw.service
Wants=network-online.target

[Service]
Type=simple
ExecStart={binary} --config {config} daemon
ExecReload=/bin/kill -HUP $MAINPID
Restart=on-failure
RestartSec=30s

# Security hardening
NoNewPrivileges=yes
ProtectSystem=strict
ProtectHome=yes
PrivateTmp=yes
ReadWritePaths=/etc/ufw {state} /run /var/log

[Install]
WantedBy=multi-user.target
"#,
        binary = binary.display(),
        config = config_path.display(),
        state = STATE_DIR,
    )
}

/// Check if the service unit is installed
pub fn is_installed() -> bool {
    Path::new(SYSTEMD_SERVICE).exists()
}
