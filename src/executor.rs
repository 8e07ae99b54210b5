//! Applies a change plan to the rule store.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backup::BackupSink;
use crate::enforcer::RuleStore;
use crate::error::{ErrorKind, ToolUnavailableError};
use crate::model::{ChangePlan, CycleError, Operation, RangeCounts, SyncResult};

/// Runs plan operations one at a time against a [`RuleStore`].
pub struct RuleExecutor<'a> {
    store: &'a dyn RuleStore,
}

impl<'a> RuleExecutor<'a> {
    pub fn new(store: &'a dyn RuleStore) -> Self {
        Self { store }
    }

    /// Apply `plan` in order, backing up its baseline first.
    ///
    /// A failed operation is recorded and the next one still runs. The only
    /// early exit is the tool becoming unusable, which is returned as an error.
    /// Conflicts in the plan are recorded as errors and counted nowhere else.
    pub async fn apply(
        &self,
        plan: ChangePlan,
        backup: Arc<dyn BackupSink>,
    ) -> Result<SyncResult, ToolUnavailableError> {
        let started_at = Utc::now();
        let mut result = SyncResult {
            added: 0,
            removed: 0,
            unchanged: plan.unchanged(),
            errors: Vec::new(),
            ranges: RangeCounts::default(),
            started_at,
            finished_at: started_at,
        };

        if plan.is_guarded() {
            warn!(
                "No IP ranges available, leaving {} owned rule(s) untouched",
                plan.baseline().len()
            );
            result.errors.push(CycleError::cycle(ErrorKind::EmptyRangeSet));
            result.finished_at = Utc::now();
            return Ok(result);
        }

        for conflict in plan.conflicts() {
            warn!(
                "Skipping {}: key already held by rule '{}'",
                conflict.rule.key(),
                conflict.held_by
            );
            result.errors.push(CycleError::operation(
                Operation::Add {
                    rule: conflict.rule.clone(),
                },
                ErrorKind::ForeignConflict(conflict.held_by.clone()),
            ));
        }

        if plan.is_empty() {
            debug!("Nothing to apply");
            result.finished_at = Utc::now();
            return Ok(result);
        }

        let snapshot = plan.baseline().to_vec();
        let saved = tokio::task::spawn_blocking(move || backup.save(&snapshot)).await;
        let backup_error = match saved {
            Ok(Ok(handle)) => {
                debug!(
                    "Backed up {} rule(s) to {}",
                    handle.rules,
                    handle.path.display()
                );
                None
            }
            Ok(Err(e)) => Some(e.0),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = backup_error {
            warn!("Pre-change backup failed, continuing: {}", message);
            result.errors.push(CycleError::cycle(ErrorKind::Backup(message)));
        }

        info!(
            "Applying {} removal(s) and {} addition(s)",
            plan.removals(),
            plan.additions()
        );

        for op in plan.into_operations() {
            let outcome = match &op {
                Operation::Remove { id, .. } => self.store.delete(id).await,
                Operation::Add { rule } => self.store.create(rule).await.map(|_| ()),
            };

            match outcome {
                Ok(()) => {
                    debug!("{}", op);
                    if op.is_add() {
                        result.added += 1;
                    } else {
                        result.removed += 1;
                    }
                }
                Err(e) => {
                    if let Some(unavailable) = e.as_unavailable() {
                        error!("Firewall tool unavailable while applying {}: {}", op, e);
                        return Err(unavailable.clone());
                    }
                    warn!("Failed to apply {}: {}", op, e);
                    let kind = ErrorKind::from(&e);
                    result.errors.push(CycleError::operation(op, kind));
                }
            }
        }

        result.finished_at = Utc::now();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupHandle;
    use crate::enforcer::mock::MockRuleStore;
    use crate::error::BackupError;
    use crate::model::{FirewallRule, IpRange, PortSpec, Protocol, RuleKey, RuleSet};
    use crate::reconciler::{compute_plan, desired_set};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const LABEL: &str = "Cloudflare IP";

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<Vec<FirewallRule>>>,
        fail: bool,
    }

    impl BackupSink for RecordingSink {
        fn save(&self, snapshot: &[FirewallRule]) -> Result<BackupHandle, BackupError> {
            if self.fail {
                return Err(BackupError("disk full".to_string()));
            }
            self.saved.lock().unwrap().push(snapshot.to_vec());
            Ok(BackupHandle {
                path: PathBuf::from("/tmp/rules.json"),
                rules: snapshot.len(),
            })
        }
    }

    fn rule(cidr: &str) -> FirewallRule {
        FirewallRule::proposed(
            RuleKey::new(
                IpRange::parse(cidr).unwrap(),
                PortSpec::new(443, Protocol::Tcp),
            ),
            LABEL,
        )
    }

    async fn plan_for(store: &MockRuleStore, cidrs: &[&str]) -> ChangePlan {
        let ranges = crate::model::RangeSet::new(
            cidrs.iter().map(|c| IpRange::parse(c).unwrap()),
            Utc::now(),
        );
        let desired = desired_set(&ranges, &[PortSpec::new(443, Protocol::Tcp)]);
        let current = RuleSet::partition(store.list(None).await.unwrap(), LABEL);
        compute_plan(&desired, &current)
    }

    #[tokio::test]
    async fn test_apply_counts_and_backs_up() {
        let store = MockRuleStore::with_rules(vec![rule("1.0.0.0/24"), rule("3.0.0.0/24")]);
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &["2.0.0.0/24", "3.0.0.0/24"]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!((result.added, result.removed, result.unchanged), (1, 1, 1));
        assert!(result.is_clean());
        let saved = sink.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].len(), 2);
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec!["- 1.0.0.0/24 443/tcp", "+ 2.0.0.0/24 443/tcp"]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let store = MockRuleStore::new();
        store.fail_on("2.0.0.0/24 443/tcp");
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &["1.0.0.0/24", "2.0.0.0/24", "3.0.0.0/24"]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!(result.added, 2);
        assert_eq!(result.errors.len(), 1);
        let err = &result.errors[0];
        assert_eq!(err.operation.as_ref().unwrap().key().to_string(), "2.0.0.0/24 443/tcp");
        assert!(matches!(err.kind, ErrorKind::Rejected(_)));
        // Operation after the failing one was still attempted
        assert_eq!(store.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_remove_does_not_stop_adds() {
        let store = MockRuleStore::with_rules(vec![rule("1.0.0.0/24")]);
        store.fail_on("1.0.0.0/24 443/tcp");
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &["2.0.0.0/24", "3.0.0.0/24"]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!((result.added, result.removed), (2, 0));
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            result.errors[0].operation,
            Some(Operation::Remove { .. })
        ));
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec![
                "- 1.0.0.0/24 443/tcp",
                "+ 2.0.0.0/24 443/tcp",
                "+ 3.0.0.0/24 443/tcp"
            ]
        );
        // The rule that failed to go is still there next to the new ones
        assert_eq!(store.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_conflict_is_recorded_not_added() {
        let mut office = rule("2.0.0.0/24");
        office.label = "office".to_string();
        let store = MockRuleStore::with_rules(vec![office]);
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &["1.0.0.0/24", "2.0.0.0/24"]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!((result.added, result.removed, result.unchanged), (1, 0, 0));
        assert_eq!(
            result.errors,
            vec![CycleError::operation(
                Operation::Add {
                    rule: rule("2.0.0.0/24")
                },
                ErrorKind::ForeignConflict("office".to_string())
            )]
        );
        assert_eq!(*store.calls.lock().unwrap(), vec!["+ 1.0.0.0/24 443/tcp"]);

        // Still reported on the next cycle, still never added
        let again = plan_for(&store, &["1.0.0.0/24", "2.0.0.0/24"]).await;
        let result = RuleExecutor::new(&store).apply(again, sink.clone()).await.unwrap();
        assert_eq!((result.added, result.unchanged), (0, 1));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_guarded_plan_records_empty_range_set() {
        let store = MockRuleStore::with_rules(vec![rule("1.0.0.0/24")]);
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &[]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!(result.removed, 0);
        assert_eq!(result.errors, vec![CycleError::cycle(ErrorKind::EmptyRangeSet)]);
        assert!(sink.saved.lock().unwrap().is_empty());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_skips_backup() {
        let store = MockRuleStore::with_rules(vec![rule("1.0.0.0/24")]);
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &["1.0.0.0/24"]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!(result.unchanged, 1);
        assert!(result.is_clean());
        assert!(sink.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_block() {
        let store = MockRuleStore::new();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let plan = plan_for(&store, &["1.0.0.0/24"]).await;

        let result = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap();

        assert_eq!(result.added, 1);
        assert_eq!(
            result.errors[0].kind,
            ErrorKind::Backup("disk full".to_string())
        );
    }

    #[tokio::test]
    async fn test_unavailable_tool_aborts() {
        let store = MockRuleStore::new();
        let sink = Arc::new(RecordingSink::default());
        let plan = plan_for(&store, &["1.0.0.0/24", "2.0.0.0/24"]).await;
        *store.unavailable.lock().unwrap() = true;

        let err = RuleExecutor::new(&store).apply(plan, sink.clone()).await.unwrap_err();
        assert_eq!(err, ToolUnavailableError::NotFound("ufw".to_string()));
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let store = MockRuleStore::with_rules(vec![rule("9.0.0.0/24")]);
        let sink = Arc::new(RecordingSink::default());

        let first = plan_for(&store, &["1.0.0.0/24", "2400:cb00::/32"]).await;
        RuleExecutor::new(&store).apply(first, sink.clone()).await.unwrap();

        let second = plan_for(&store, &["1.0.0.0/24", "2400:cb00::/32"]).await;
        let result = RuleExecutor::new(&store).apply(second, sink.clone()).await.unwrap();
        assert_eq!((result.added, result.removed, result.unchanged), (0, 0, 2));
    }
}
