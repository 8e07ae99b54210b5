//! Sync command implementation.

use anyhow::Result;
use tracing::{debug, info};

use super::{build_orchestrator, print_result};
use crate::config::Config;
use crate::enforcer::check_root;
use crate::lock::LockGuard;
use crate::orchestrator::PlannedCycle;

/// Run the sync command
pub async fn run(dry_run: bool, config: &Config) -> Result<()> {
    check_root(&config.ufw.binary)?;
    let lock = LockGuard::acquire(&config.lock_file)?;
    debug!("Holding lock {:?}", lock.path());

    let orchestrator = build_orchestrator(config)?;

    if dry_run {
        info!("Dry run: no rule will be changed");
        let planned = orchestrator.plan_once().await?;
        print_plan(&planned);
        return Ok(());
    }

    let result = orchestrator.run_once().await?;
    print_result(&result);
    Ok(())
}

fn print_plan(planned: &PlannedCycle) {
    let plan = &planned.plan;
    println!();
    println!(
        "Ranges: {} IPv4, {} IPv6",
        planned.ranges.v4, planned.ranges.v6
    );

    for err in &planned.errors {
        println!("[WARN] {}", err);
    }

    if plan.is_guarded() {
        println!(
            "[WARN] No ranges available, {} managed rule(s) would be left untouched",
            plan.baseline().len()
        );
    } else if plan.is_empty() {
        println!("[OK] Up to date ({} rule(s) unchanged)", plan.unchanged());
    } else {
        println!(
            "Plan: {} removal(s), {} addition(s), {} unchanged",
            plan.removals(),
            plan.additions(),
            plan.unchanged()
        );
        for op in plan.operations() {
            println!("  {}", op);
        }
    }

    for conflict in plan.conflicts() {
        println!(
            "[WARN] {} not added: already held by rule '{}'",
            conflict.rule.key(),
            conflict.held_by
        );
    }
    println!();
}
