//! Status command implementation.

use anyhow::Result;

use crate::config::Config;
use crate::enforcer::{check_root, create_rule_store};
use crate::installer::is_installed;
use crate::model::IpFamily;
use crate::state::PersistedStatus;
use crate::utils::{format_duration_ago, format_interval, truncate};

/// Run the status command
pub async fn run(config: &Config) -> Result<()> {
    println!();

    let service = if is_installed() {
        "installed"
    } else {
        "NOT INSTALLED"
    };
    println!("Service: {}", service);
    println!("Label: {}", config.ufw.label);
    let ports: Vec<String> = config
        .ufw
        .effective_ports()
        .iter()
        .map(|p| p.to_string())
        .collect();
    println!("Ports: {}", ports.join(", "));
    println!("Interval: {}", format_interval(config.interval()));
    println!();

    // The daemon may be a different process, so read what it persisted
    match PersistedStatus::load(&config.state_file) {
        Ok(state) => match &state.last_result {
            Some(last) => {
                let local: chrono::DateTime<chrono::Local> = last.finished_at.into();
                println!(
                    "Last sync: {} ({})",
                    local.format("%Y-%m-%d %H:%M:%S"),
                    format_duration_ago(last.finished_at)
                );
                println!("  {}", last.summary());
                for err in &last.errors {
                    println!("  - {}", truncate(&err.to_string(), 160));
                }
                if state.consecutive_error_cycles > 0 {
                    println!(
                        "Consecutive cycles with errors: {}",
                        state.consecutive_error_cycles
                    );
                }
                println!("Total cycles: {}", state.total_cycles);
            }
            None => println!("Last sync: never"),
        },
        Err(e) => println!("Last sync: unknown ({:#})", e),
    }

    // Listing rules needs the same privileges as changing them
    if check_root(&config.ufw.binary).is_err() {
        println!("Live rules: unavailable (run as root)");
        println!();
        return Ok(());
    }

    let store = create_rule_store(&config.ufw);
    match store.list(Some(&config.ufw.label)).await {
        Ok(rules) => {
            let count = |family: IpFamily| rules.iter().filter(|r| r.family() == family).count();
            println!(
                "Live rules: {} IPv4, {} IPv6",
                count(IpFamily::V4),
                count(IpFamily::V6)
            );
        }
        Err(e) => println!("Live rules: unavailable ({})", e),
    }
    println!();

    Ok(())
}
