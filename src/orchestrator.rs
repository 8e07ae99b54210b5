//! Drives reconciliation cycles: fetch, diff, apply, record.
//!
//! ```text
//!  Idle ──▶ Fetching ──▶ Diffing ──▶ Applying ──▶ Idle
//!   ▲                                              │
//!   └──────────── Waiting (daemon only) ◀──────────┘
//! ```
//!
//! At most one cycle runs at a time. [`SyncOrchestrator::run_once`] waits for
//! a running cycle to finish; [`SyncOrchestrator::try_run_once`] returns
//! [`SyncError::Busy`] instead. The daemon's manual trigger is a
//! [`Notify`], which stores at most one pending request, so duplicate
//! triggers collapse into a single extra cycle.

use chrono::Utc;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backup::BackupSink;
use crate::config::{Config, DefaultPolicy};
use crate::enforcer::RuleStore;
use crate::error::{ErrorKind, RuleStoreError, SyncError};
use crate::executor::RuleExecutor;
use crate::fetcher::{into_ranges, RangeFetcher};
use crate::model::{
    ChangePlan, CycleError, FirewallRule, IpFamily, PortSpec, RangeCounts, RangeSet, RuleSet,
    SyncResult,
};
use crate::reconciler::{compute_plan, desired_set, DesiredSet};
use crate::signal::ShutdownToken;
use crate::state::PersistedStatus;
use crate::utils::format_interval;

/// What one cycle reconciles, taken from validated configuration.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub label: String,
    pub ports: Vec<PortSpec>,
    pub families: Vec<IpFamily>,
    pub default_policy: Option<DefaultPolicy>,
    pub ensure_enabled: bool,
}

impl CycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            label: config.ufw.label.clone(),
            ports: config.ufw.effective_ports(),
            families: config.cloudflare.families(),
            default_policy: config.ufw.default_policy,
            ensure_enabled: config.ufw.ensure_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Diffing,
    Applying,
    Waiting,
}

/// A computed but unapplied plan (`sync --dry-run`).
#[derive(Debug)]
pub struct PlannedCycle {
    pub plan: ChangePlan,
    pub errors: Vec<CycleError>,
    pub ranges: RangeCounts,
}

pub struct SyncOrchestrator {
    settings: CycleSettings,
    fetcher: Box<dyn RangeFetcher>,
    store: Box<dyn RuleStore>,
    backup: Arc<dyn BackupSink>,
    state_path: Option<PathBuf>,
    gate: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
    last: Mutex<Option<SyncResult>>,
    trigger: Arc<Notify>,
}

/// Puts the orchestrator back to `Idle` however a cycle ends.
struct PhaseReset<'a>(&'a SyncOrchestrator);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.set_phase(Phase::Idle);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncOrchestrator {
    pub fn new(
        settings: CycleSettings,
        fetcher: Box<dyn RangeFetcher>,
        store: Box<dyn RuleStore>,
        backup: Box<dyn BackupSink>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            store,
            backup: Arc::from(backup),
            state_path: None,
            gate: tokio::sync::Mutex::new(()),
            phase: Mutex::new(Phase::Idle),
            last: Mutex::new(None),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Also persist every cycle result to `path`.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Result of the most recent cycle run by this orchestrator.
    pub fn status(&self) -> Option<SyncResult> {
        lock(&self.last).clone()
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    /// Handle used to request an immediate cycle from the daemon loop.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Ask a running daemon for an extra cycle. Requests made while one is
    /// already pending are merged.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Run one cycle, waiting for any cycle already in progress.
    pub async fn run_once(&self) -> Result<SyncResult, SyncError> {
        let _slot = self.gate.lock().await;
        self.cycle().await
    }

    /// Run one cycle unless one is already in progress.
    pub async fn try_run_once(&self) -> Result<SyncResult, SyncError> {
        let _slot = self.gate.try_lock().map_err(|_| SyncError::Busy)?;
        self.cycle().await
    }

    /// Fetch and diff without changing anything.
    pub async fn plan_once(&self) -> Result<PlannedCycle, SyncError> {
        let _slot = self.gate.lock().await;
        let _reset = PhaseReset(self);

        let mut errors = Vec::new();
        let ranges = self.fetch_ranges(&mut errors).await;
        let desired = desired_set(&ranges, &self.settings.ports);

        self.set_phase(Phase::Diffing);
        let plan = match self.current_rules().await? {
            Some(current) => compute_plan(&desired, &current),
            None => {
                errors.push(CycleError::cycle(ErrorKind::ListRules(
                    "could not read the live rule set".to_string(),
                )));
                ChangePlan::default()
            }
        };

        Ok(PlannedCycle {
            plan,
            errors,
            ranges: RangeCounts::of(&ranges),
        })
    }

    /// Reconcile the owned rules back to a backup's contents.
    ///
    /// Only rules carrying the configured label are restored. An empty
    /// backup gives a guarded no-op, never a removal of every owned rule.
    pub async fn restore(&self, rules: &[FirewallRule]) -> Result<SyncResult, SyncError> {
        let _slot = self.gate.lock().await;
        let _reset = PhaseReset(self);
        let started_at = Utc::now();

        let desired: DesiredSet = rules
            .iter()
            .filter(|r| r.label == self.settings.label)
            .map(FirewallRule::key)
            .collect();
        info!("Restoring {} owned rule(s) from backup", desired.len());

        self.set_phase(Phase::Diffing);
        let Some(current) = self.current_rules().await? else {
            let result = SyncResult::skipped(
                started_at,
                vec![CycleError::cycle(ErrorKind::ListRules(
                    "could not read the live rule set".to_string(),
                ))],
            );
            self.finish(&result).await;
            return Ok(result);
        };
        let plan = compute_plan(&desired, &current);

        self.set_phase(Phase::Applying);
        let result = RuleExecutor::new(self.store.as_ref())
            .apply(plan, Arc::clone(&self.backup))
            .await?
            .into_cycle(started_at, Vec::new(), RangeCounts::default());
        self.finish(&result).await;
        Ok(result)
    }

    /// Run cycles at a fixed rate until `token` is cancelled.
    ///
    /// The schedule is measured from cycle starts; a cycle that overruns
    /// skips the missed ticks instead of bunching them. Cancellation is
    /// checked only between cycles, so a running cycle always completes.
    /// Returns early only when the firewall tool becomes unusable.
    pub async fn run_daemon(
        &self,
        interval: Duration,
        token: ShutdownToken,
    ) -> Result<(), SyncError> {
        info!(
            "Daemon started, syncing every {}",
            format_interval(interval)
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.set_phase(Phase::Waiting);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => debug!("Scheduled sync"),
                _ = self.trigger.notified() => info!("Manual sync requested"),
            }
            if token.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_once().await {
                error!("Stopping daemon: {}", e);
                self.set_phase(Phase::Idle);
                return Err(e);
            }
        }

        self.set_phase(Phase::Idle);
        info!("Daemon stopped");
        Ok(())
    }

    async fn cycle(&self) -> Result<SyncResult, SyncError> {
        let _reset = PhaseReset(self);
        let started_at = Utc::now();
        let mut errors = Vec::new();

        let ranges = self.fetch_ranges(&mut errors).await;

        self.set_phase(Phase::Diffing);
        self.prepare(&mut errors).await?;

        let Some(current) = self.current_rules().await? else {
            errors.push(CycleError::cycle(ErrorKind::ListRules(
                "could not read the live rule set".to_string(),
            )));
            let mut result = SyncResult::skipped(started_at, errors);
            result.ranges = RangeCounts::of(&ranges);
            self.finish(&result).await;
            return Ok(result);
        };

        let desired = desired_set(&ranges, &self.settings.ports);
        let plan = compute_plan(&desired, &current);
        debug!(
            "Plan: {} removal(s), {} addition(s), {} unchanged",
            plan.removals(),
            plan.additions(),
            plan.unchanged()
        );

        self.set_phase(Phase::Applying);
        let result = RuleExecutor::new(self.store.as_ref())
            .apply(plan, Arc::clone(&self.backup))
            .await?
            .into_cycle(started_at, errors, RangeCounts::of(&ranges));

        self.finish(&result).await;
        Ok(result)
    }

    /// Fetch every configured family. If any family fails the whole set is
    /// empty, so the reconciler's guard keeps the current rules.
    async fn fetch_ranges(&self, errors: &mut Vec<CycleError>) -> RangeSet {
        self.set_phase(Phase::Fetching);
        let fetched = join_all(self.settings.families.iter().map(|&family| async move {
            let result = self
                .fetcher
                .fetch(family)
                .await
                .and_then(|entries| into_ranges(family, &entries));
            (family, result)
        }))
        .await;

        let mut all = Vec::new();
        let mut failed = false;
        for (family, result) in fetched {
            match result {
                Ok(ranges) => {
                    debug!("{} {} range(s)", ranges.len(), family);
                    all.extend(ranges);
                }
                Err(e) => {
                    warn!("Fetching {} ranges failed: {}", family, e);
                    errors.push(CycleError::cycle(ErrorKind::from(&e)));
                    failed = true;
                }
            }
        }

        let ranges = if failed {
            RangeSet::empty(Utc::now())
        } else {
            RangeSet::new(all, Utc::now())
        };
        debug!(
            "Range set of {} entries fetched at {}",
            ranges.len(),
            ranges.fetched_at().to_rfc3339()
        );
        ranges
    }

    async fn prepare(&self, errors: &mut Vec<CycleError>) -> Result<(), SyncError> {
        if let Some(policy) = self.settings.default_policy {
            let outcome = self.store.set_default_policy(policy).await;
            record_prepare(outcome, errors)?;
        }
        if self.settings.ensure_enabled {
            let outcome = self.store.ensure_enabled().await;
            record_prepare(outcome, errors)?;
        }
        Ok(())
    }

    /// Fresh snapshot of the live rules, `None` when listing failed.
    async fn current_rules(&self) -> Result<Option<RuleSet>, SyncError> {
        match self.store.list(None).await {
            Ok(rules) => Ok(Some(RuleSet::partition(rules, &self.settings.label))),
            Err(e) => {
                if let Some(unavailable) = e.as_unavailable() {
                    return Err(unavailable.clone().into());
                }
                warn!("Listing firewall rules failed: {}", e);
                Ok(None)
            }
        }
    }

    async fn finish(&self, result: &SyncResult) {
        if result.is_clean() {
            info!("Sync complete: {}", result.summary());
        } else {
            warn!("Sync complete with errors: {}", result.summary());
            for err in &result.errors {
                warn!("  {}", err);
            }
        }

        if let Some(path) = self.state_path.clone() {
            let snapshot = result.clone();
            let saved = tokio::task::spawn_blocking(move || {
                PersistedStatus::update(&path, &snapshot)
                    .map_err(|e| format!("{:?}: {}", path, e))
            })
            .await;
            match saved {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Failed to save state to {}", e),
                Err(e) => warn!("State writer task failed: {}", e),
            }
        }
        *lock(&self.last) = Some(result.clone());
    }
}

fn record_prepare(
    outcome: Result<(), RuleStoreError>,
    errors: &mut Vec<CycleError>,
) -> Result<(), SyncError> {
    if let Err(e) = outcome {
        if let Some(unavailable) = e.as_unavailable() {
            return Err(unavailable.clone().into());
        }
        warn!("Firewall preparation failed: {}", e);
        errors.push(CycleError::cycle(ErrorKind::Prepare(e.to_string())));
    }
    Ok(())
}
