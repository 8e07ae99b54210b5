//! Diff between the desired rules and the live owned rules.
//!
//! Pure functions over data: nothing here talks to the firewall. The plan
//! lists every removal before any addition, each group in ascending
//! `(cidr, port, protocol)` order, so identical inputs always give identical
//! plans whatever order they arrived in.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::warn;

use crate::model::{ChangePlan, Conflict, FirewallRule, Operation, PortSpec, RangeSet, RuleKey, RuleSet};

/// Every rule that should exist, keyed and ordered by `(cidr, port, protocol)`.
pub type DesiredSet = BTreeSet<RuleKey>;

/// Cross product of the provider ranges and the configured port/protocol pairs.
pub fn desired_set(ranges: &RangeSet, ports: &[PortSpec]) -> DesiredSet {
    ranges
        .iter()
        .flat_map(|range| ports.iter().map(move |spec| RuleKey::new(*range, *spec)))
        .collect()
}

/// Compute the change plan that turns the owned rules into `desired`.
///
/// An empty `desired` set means there is nothing trustworthy to reconcile
/// against; the result is a guarded plan with no operations at all, never a
/// plan that removes every owned rule. Foreign rules are never removed; they
/// are only consulted so that a key one of them already holds is reported as
/// a conflict instead of being added.
pub fn compute_plan(desired: &DesiredSet, current: &RuleSet) -> ChangePlan {
    let owned = current.owned();
    let baseline = owned.to_vec();

    if desired.is_empty() {
        return ChangePlan::guarded(baseline);
    }

    let mut removals: Vec<(RuleKey, &FirewallRule)> = Vec::new();
    let mut present: HashSet<RuleKey> = HashSet::with_capacity(owned.len());
    let mut unchanged = 0;

    for rule in owned {
        let key = rule.key();
        if desired.contains(&key) {
            present.insert(key);
            unchanged += 1;
        } else if rule.id.is_some() {
            removals.push((key, rule));
        } else {
            warn!("Owned rule {} has no id, it cannot be removed", key);
        }
    }

    // Rule ids break ties between duplicates of the same key
    removals.sort_by(|(a, ra), (b, rb)| a.cmp(b).then_with(|| ra.id.cmp(&rb.id)));

    let mut operations: Vec<Operation> = removals
        .into_iter()
        .filter_map(|(_, rule)| {
            rule.id.clone().map(|id| Operation::Remove {
                id,
                rule: rule.clone(),
            })
        })
        .collect();

    // Smallest label wins when several foreign rules share a key
    let mut held: HashMap<RuleKey, &str> = HashMap::new();
    for rule in current.foreign() {
        held.entry(rule.key())
            .and_modify(|label| {
                if rule.label.as_str() < *label {
                    *label = rule.label.as_str();
                }
            })
            .or_insert(rule.label.as_str());
    }

    let mut conflicts = Vec::new();
    for key in desired.iter().filter(|key| !present.contains(*key)) {
        let rule = FirewallRule::proposed(*key, current.label());
        match held.get(key) {
            Some(label) => {
                warn!("Not adding {}: already held by rule '{}'", key, label);
                conflicts.push(Conflict {
                    rule,
                    held_by: label.to_string(),
                });
            }
            None => operations.push(Operation::Add { rule }),
        }
    }

    ChangePlan::new(operations, unchanged, baseline).with_conflicts(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, IpRange, Protocol, RuleId};
    use chrono::Utc;

    const LABEL: &str = "Cloudflare IP";

    fn ranges(cidrs: &[&str]) -> RangeSet {
        RangeSet::new(cidrs.iter().map(|c| IpRange::parse(c).unwrap()), Utc::now())
    }

    fn live(cidr: &str, port: u16, protocol: Protocol, label: &str, id: &str) -> FirewallRule {
        FirewallRule {
            id: Some(RuleId::new(id)),
            cidr: cidr.parse().unwrap(),
            port,
            protocol,
            label: label.to_string(),
            direction: Direction::Inbound,
        }
    }

    fn tcp443() -> Vec<PortSpec> {
        vec![PortSpec::new(443, Protocol::Tcp)]
    }

    fn describe(plan: &ChangePlan) -> Vec<String> {
        plan.operations().iter().map(|op| op.to_string()).collect()
    }

    #[test]
    fn test_desired_set_is_cross_product() {
        let ports = vec![
            PortSpec::new(443, Protocol::Tcp),
            PortSpec::new(443, Protocol::Udp),
            PortSpec::new(80, Protocol::Tcp),
        ];
        let desired = desired_set(&ranges(&["1.0.0.0/24", "2.0.0.0/24"]), &ports);
        assert_eq!(desired.len(), 6);
    }

    #[test]
    fn test_first_sync_adds_everything() {
        let desired = desired_set(&ranges(&["1.0.0.0/24"]), &tcp443());
        let current = RuleSet::partition(Vec::new(), LABEL);
        let plan = compute_plan(&desired, &current);

        assert_eq!(describe(&plan), vec!["+ 1.0.0.0/24 443/tcp"]);
        assert_eq!(plan.unchanged(), 0);
        match &plan.operations()[0] {
            Operation::Add { rule } => {
                assert_eq!(rule.label, LABEL);
                assert!(rule.id.is_none());
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn test_replacement_removes_before_adding() {
        let desired = desired_set(&ranges(&["2.0.0.0/24"]), &tcp443());
        let current = RuleSet::partition(
            vec![live("1.0.0.0/24", 443, Protocol::Tcp, LABEL, "a")],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);

        assert_eq!(
            describe(&plan),
            vec!["- 1.0.0.0/24 443/tcp", "+ 2.0.0.0/24 443/tcp"]
        );
        assert_eq!(plan.removals(), 1);
        assert_eq!(plan.additions(), 1);
    }

    #[test]
    fn test_matching_rules_are_unchanged() {
        let desired = desired_set(&ranges(&["1.0.0.0/24", "2.0.0.0/24"]), &tcp443());
        let current = RuleSet::partition(
            vec![
                live("1.0.0.0/24", 443, Protocol::Tcp, LABEL, "a"),
                live("2.0.0.0/24", 443, Protocol::Tcp, LABEL, "b"),
            ],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged(), 2);
        assert!(!plan.is_guarded());
    }

    #[test]
    fn test_protocol_or_port_change_is_remove_plus_add() {
        let desired = desired_set(&ranges(&["1.0.0.0/24"]), &[PortSpec::new(443, Protocol::Udp)]);
        let current = RuleSet::partition(
            vec![live("1.0.0.0/24", 443, Protocol::Tcp, LABEL, "a")],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);
        assert_eq!(
            describe(&plan),
            vec!["- 1.0.0.0/24 443/tcp", "+ 1.0.0.0/24 443/udp"]
        );
    }

    #[test]
    fn test_foreign_rules_never_touched() {
        let desired = desired_set(&ranges(&["2.0.0.0/24"]), &tcp443());
        let current = RuleSet::partition(
            vec![
                live("10.0.0.0/8", 22, Protocol::Tcp, "ssh", "f1"),
                live("1.0.0.0/24", 443, Protocol::Tcp, "cloudflare", "f2"),
                live("2.0.0.0/24", 443, Protocol::Tcp, "other", "f3"),
            ],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged(), 0);
        assert_eq!(plan.conflicts()[0].held_by, "other");
    }

    #[test]
    fn test_key_held_by_foreign_rule_is_a_conflict() {
        let desired = desired_set(&ranges(&["1.0.0.0/24", "2.0.0.0/24"]), &tcp443());
        let current = RuleSet::partition(
            vec![
                live("2.0.0.0/24", 443, Protocol::Tcp, "office", "f1"),
                live("2.0.0.0/24", 443, Protocol::Tcp, "", "f2"),
                // Same source, different protocol: not the same ufw rule
                live("1.0.0.0/24", 443, Protocol::Udp, "office", "f3"),
            ],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);

        assert_eq!(describe(&plan), vec!["+ 1.0.0.0/24 443/tcp"]);
        assert_eq!(plan.conflicts().len(), 1);
        let conflict = &plan.conflicts()[0];
        assert_eq!(conflict.rule.key().to_string(), "2.0.0.0/24 443/tcp");
        assert_eq!(conflict.rule.label, LABEL);
        assert_eq!(conflict.held_by, "");
    }

    #[test]
    fn test_owned_copy_beats_foreign_conflict() {
        let desired = desired_set(&ranges(&["2.0.0.0/24"]), &tcp443());
        let current = RuleSet::partition(
            vec![
                live("2.0.0.0/24", 443, Protocol::Tcp, "office", "f1"),
                live("2.0.0.0/24", 443, Protocol::Tcp, LABEL, "a"),
            ],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);
        assert!(plan.is_empty());
        assert!(plan.conflicts().is_empty());
        assert_eq!(plan.unchanged(), 1);
    }

    #[test]
    fn test_empty_range_set_is_guarded() {
        let desired = desired_set(&ranges(&[]), &tcp443());
        let current = RuleSet::partition(
            vec![
                live("1.0.0.0/24", 443, Protocol::Tcp, LABEL, "a"),
                live("2.0.0.0/24", 443, Protocol::Tcp, LABEL, "b"),
            ],
            LABEL,
        );
        let plan = compute_plan(&desired, &current);
        assert!(plan.is_empty());
        assert!(plan.is_guarded());
        assert_eq!(plan.baseline().len(), 2);
    }

    #[test]
    fn test_owned_rule_without_id_is_not_removed() {
        let desired = desired_set(&ranges(&["2.0.0.0/24"]), &tcp443());
        let mut orphan = live("1.0.0.0/24", 443, Protocol::Tcp, LABEL, "x");
        orphan.id = None;
        let current = RuleSet::partition(vec![orphan], LABEL);
        let plan = compute_plan(&desired, &current);
        assert_eq!(describe(&plan), vec!["+ 2.0.0.0/24 443/tcp"]);
    }

    #[test]
    fn test_ordering_v4_before_v6_and_by_port() {
        let ports = vec![
            PortSpec::new(8443, Protocol::Tcp),
            PortSpec::new(443, Protocol::Udp),
            PortSpec::new(443, Protocol::Tcp),
        ];
        let desired = desired_set(&ranges(&["2400:cb00::/32", "104.16.0.0/13", "1.0.0.0/24"]), &ports);
        let plan = compute_plan(&desired, &RuleSet::partition(Vec::new(), LABEL));
        let ops = describe(&plan);
        assert_eq!(ops[0], "+ 1.0.0.0/24 443/tcp");
        assert_eq!(ops[1], "+ 1.0.0.0/24 443/udp");
        assert_eq!(ops[2], "+ 1.0.0.0/24 8443/tcp");
        assert_eq!(ops[3], "+ 104.16.0.0/13 443/tcp");
        assert_eq!(ops[8], "+ 2400:cb00::/32 8443/tcp");
    }

    #[test]
    fn test_removal_order_ignores_listing_order() {
        let desired = desired_set(&ranges(&["9.0.0.0/24"]), &tcp443());
        let a = live("3.0.0.0/24", 443, Protocol::Tcp, LABEL, "a");
        let b = live("1.0.0.0/24", 443, Protocol::Tcp, LABEL, "b");
        let c = live("2.0.0.0/24", 80, Protocol::Tcp, LABEL, "c");

        let p1 = compute_plan(
            &desired,
            &RuleSet::partition(vec![a.clone(), b.clone(), c.clone()], LABEL),
        );
        let p2 = compute_plan(&desired, &RuleSet::partition(vec![c, a, b], LABEL));
        assert_eq!(p1.operations(), p2.operations());
        assert_eq!(
            describe(&p1),
            vec![
                "- 1.0.0.0/24 443/tcp",
                "- 2.0.0.0/24 80/tcp",
                "- 3.0.0.0/24 443/tcp",
                "+ 9.0.0.0/24 443/tcp"
            ]
        );
    }
}
