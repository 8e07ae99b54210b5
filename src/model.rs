//! Data model shared by the reconciliation engine.
//!
//! Every value here is built once per cycle and dropped when the cycle ends;
//! nothing is cached across cycles.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, InvalidCidr};

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("v4"),
            IpFamily::V6 => f.write_str("v6"),
        }
    }
}

impl FromStr for IpFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v4" | "ipv4" | "4" => Ok(IpFamily::V4),
            "v6" | "ipv6" | "6" => Ok(IpFamily::V6),
            other => Err(format!("Invalid IP family '{}'. Valid values: v4, v6", other)),
        }
    }
}

/// A single provider range. The family is always derived from the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpRange {
    net: IpNet,
}

impl IpRange {
    /// Parse a CIDR (or bare address, taken as a host route) and normalize it.
    ///
    /// Host bits are cleared, so `1.0.0.7/24` becomes `1.0.0.0/24`.
    pub fn parse(s: &str) -> Result<Self, InvalidCidr> {
        let trimmed = s.trim();
        // ipnet and std report parse failures with different error types
        let net = if trimmed.contains('/') {
            trimmed
                .parse::<IpNet>()
                .map_err(|_| InvalidCidr(s.to_string()))
        } else {
            trimmed
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|_| InvalidCidr(s.to_string()))
        }?;
        Ok(Self { net: net.trunc() })
    }

    pub fn net(&self) -> IpNet {
        self.net
    }

    pub fn cidr(&self) -> String {
        self.net.to_string()
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.net)
    }
}

impl From<IpNet> for IpRange {
    fn from(net: IpNet) -> Self {
        Self { net: net.trunc() }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

/// Immutable snapshot of the provider's ranges from one fetch.
#[derive(Debug, Clone)]
pub struct RangeSet {
    ranges: BTreeSet<IpRange>,
    fetched_at: DateTime<Utc>,
}

impl RangeSet {
    /// Build a set; entries normalizing to the same CIDR collapse into one.
    pub fn new<I>(ranges: I, fetched_at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = IpRange>,
    {
        Self {
            ranges: ranges.into_iter().collect(),
            fetched_at,
        }
    }

    pub fn empty(fetched_at: DateTime<Utc>) -> Self {
        Self::new(std::iter::empty(), fetched_at)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpRange> {
        self.ranges.iter()
    }

    pub fn count(&self, family: IpFamily) -> usize {
        self.ranges.iter().filter(|r| r.family() == family).count()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Transport protocol of an allow rule.
///
/// Variant order is the lexical order of the names, which the plan ordering relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Any,
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Any => f.write_str("any"),
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Protocol::Any),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!(
                "Invalid protocol '{}'. Valid values: tcp, udp, any",
                other
            )),
        }
    }
}

/// A configured `(port, protocol)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default, alias = "protocol")]
    pub proto: Protocol,
}

impl PortSpec {
    pub fn new(port: u16, proto: Protocol) -> Self {
        Self { port, proto }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

/// Identity of a rule for matching: `(cidr, port, protocol)`.
///
/// The derived ordering (network, then port, then protocol) is the plan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub cidr: IpNet,
    pub port: u16,
    pub protocol: Protocol,
}

impl RuleKey {
    pub fn new(range: IpRange, spec: PortSpec) -> Self {
        Self {
            cidr: range.net(),
            port: spec.port,
            protocol: spec.proto,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.cidr, self.port, self.protocol)
    }
}

/// Opaque handle assigned by the rule store to a live rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Inbound,
}

/// An inbound allow rule, either read from the firewall or proposed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Set for rules read back from the firewall, `None` for proposed rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RuleId>,
    pub cidr: IpNet,
    pub port: u16,
    pub protocol: Protocol,
    pub label: String,
    #[serde(default)]
    pub direction: Direction,
}

impl FirewallRule {
    /// A rule the reconciler wants created.
    pub fn proposed(key: RuleKey, label: &str) -> Self {
        Self {
            id: None,
            cidr: key.cidr,
            port: key.port,
            protocol: key.protocol,
            label: label.to_string(),
            direction: Direction::Inbound,
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            cidr: self.cidr,
            port: self.port,
            protocol: self.protocol,
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.cidr)
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allow {} from {} to port {}",
            self.protocol, self.cidr, self.port
        )
    }
}

/// Live rules split by ownership label.
#[derive(Debug, Clone)]
pub struct RuleSet {
    label: String,
    owned: Vec<FirewallRule>,
    foreign: Vec<FirewallRule>,
}

impl RuleSet {
    /// Partition rules: a rule is owned iff its label equals `label`.
    pub fn partition(rules: Vec<FirewallRule>, label: &str) -> Self {
        let (owned, foreign) = rules.into_iter().partition(|r| r.label == label);
        Self {
            label: label.to_string(),
            owned,
            foreign,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn owned(&self) -> &[FirewallRule] {
        &self.owned
    }

    pub fn foreign(&self) -> &[FirewallRule] {
        &self.foreign
    }
}

/// One step of a change plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { rule: FirewallRule },
    Remove { id: RuleId, rule: FirewallRule },
}

impl Operation {
    pub fn key(&self) -> RuleKey {
        match self {
            Operation::Add { rule } | Operation::Remove { rule, .. } => rule.key(),
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Operation::Add { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Add { rule } => write!(f, "+ {}", rule.key()),
            Operation::Remove { rule, .. } => write!(f, "- {}", rule.key()),
        }
    }
}

/// A desired rule whose key is already held by a rule with another label.
///
/// ufw treats rules differing only by comment as the same rule, so adding it
/// would either be skipped or relabel the other rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub rule: FirewallRule,
    pub held_by: String,
}

/// Ordered rule mutations for one cycle: every removal, then every addition.
#[derive(Debug, Clone, Default)]
pub struct ChangePlan {
    operations: Vec<Operation>,
    unchanged: usize,
    baseline: Vec<FirewallRule>,
    conflicts: Vec<Conflict>,
    guarded: bool,
}

impl ChangePlan {
    pub(crate) fn new(
        operations: Vec<Operation>,
        unchanged: usize,
        baseline: Vec<FirewallRule>,
    ) -> Self {
        Self {
            operations,
            unchanged,
            baseline,
            conflicts: Vec::new(),
            guarded: false,
        }
    }

    pub(crate) fn with_conflicts(mut self, conflicts: Vec<Conflict>) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// The no-op plan produced when there is nothing to reconcile against.
    pub(crate) fn guarded(baseline: Vec<FirewallRule>) -> Self {
        Self {
            guarded: true,
            baseline,
            ..Default::default()
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn additions(&self) -> usize {
        self.operations.iter().filter(|op| op.is_add()).count()
    }

    pub fn removals(&self) -> usize {
        self.operations.len() - self.additions()
    }

    /// Owned rules already matching a desired key.
    pub fn unchanged(&self) -> usize {
        self.unchanged
    }

    /// Owned rules the plan was computed from, saved as the pre-change backup.
    pub fn baseline(&self) -> &[FirewallRule] {
        &self.baseline
    }

    /// Desired rules left out of the plan because a foreign rule holds the key.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// True when the empty-range guard suppressed all changes.
    pub fn is_guarded(&self) -> bool {
        self.guarded
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}

/// An error recorded during a cycle, with the operation it belongs to (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    pub kind: ErrorKind,
}

impl CycleError {
    pub fn cycle(kind: ErrorKind) -> Self {
        Self {
            operation: None,
            kind,
        }
    }

    pub fn operation(operation: Operation, kind: ErrorKind) -> Self {
        Self {
            operation: Some(operation),
            kind,
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            Some(op) => write!(f, "{}: {}", op, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Number of provider ranges per family seen in a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCounts {
    pub v4: usize,
    pub v6: usize,
}

impl RangeCounts {
    pub fn of(ranges: &RangeSet) -> Self {
        Self {
            v4: ranges.count(IpFamily::V4),
            v6: ranges.count(IpFamily::V6),
        }
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    #[serde(default)]
    pub errors: Vec<CycleError>,
    #[serde(default)]
    pub ranges: RangeCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// A cycle that stopped before applying anything.
    pub fn skipped(started_at: DateTime<Utc>, errors: Vec<CycleError>) -> Self {
        Self {
            added: 0,
            removed: 0,
            unchanged: 0,
            errors,
            ranges: RangeCounts::default(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Widen an apply result to the whole cycle: earlier errors come first.
    pub fn into_cycle(
        self,
        started_at: DateTime<Utc>,
        earlier_errors: Vec<CycleError>,
        ranges: RangeCounts,
    ) -> Self {
        let mut errors = earlier_errors;
        errors.extend(self.errors);
        Self {
            errors,
            ranges,
            started_at,
            ..self
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.signed_duration_since(self.started_at)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} unchanged, {} error(s) in {}ms",
            self.added,
            self.removed,
            self.unchanged,
            self.errors.len(),
            self.duration().num_milliseconds()
        )
    }
}
