//! UFW rule store.
//!
//! Rules are read from `ufw status numbered`. UFW rule numbers shift on every
//! insert and delete, so the [`RuleId`] handed out is a fingerprint of the rule
//! (port, protocol, source, comment) and the number is looked up again right
//! before each delete.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::RuleStore;
use crate::cmd_abstraction::{CommandError, CommandOutput, CommandRunner};
use crate::config::DefaultPolicy;
use crate::error::{RuleIntent, RuleStoreError, ToolUnavailableError};
use crate::model::{Direction, FirewallRule, IpRange, Protocol, RuleId};

/// UFW-backed rule store
pub struct UfwRuleStore<R: CommandRunner> {
    binary: String,
    timeout: Duration,
    runner: R,
}

impl<R: CommandRunner> UfwRuleStore<R> {
    pub fn new(binary: impl Into<String>, timeout: Duration, runner: R) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            runner,
        }
    }

    /// Run ufw, mapping transport failures and non-zero exits onto `intent`.
    async fn exec(&self, args: Vec<String>, intent: RuleIntent) -> Result<String, RuleStoreError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = self
            .runner
            .run(&self.binary, &args, self.timeout)
            .await
            .map_err(|e| self.command_error(e, intent.clone()))?;

        if output.success {
            Ok(output.stdout)
        } else {
            Err(self.rejected(&output, intent))
        }
    }

    fn command_error(&self, err: CommandError, intent: RuleIntent) -> RuleStoreError {
        match err {
            CommandError::NotFound(tool) => ToolUnavailableError::NotFound(tool).into(),
            CommandError::PermissionDenied(tool) => ToolUnavailableError::PermissionDenied {
                tool,
                message: "cannot execute".to_string(),
            }
            .into(),
            CommandError::Timeout { timeout, .. } => RuleStoreError::Timeout { intent, timeout },
            CommandError::Io { message, .. } => RuleStoreError::Rejected { intent, message },
        }
    }

    fn rejected(&self, output: &CommandOutput, intent: RuleIntent) -> RuleStoreError {
        let message = output.message();
        if message.contains("need to be root") {
            return ToolUnavailableError::PermissionDenied {
                tool: self.binary.clone(),
                message,
            }
            .into();
        }
        RuleStoreError::Rejected { intent, message }
    }

    /// Numbered listing with the parsed rules, in ufw order.
    ///
    /// An inactive firewall prints no rules at all, which must not be read
    /// as an empty rule set.
    async fn numbered(&self) -> Result<Vec<(usize, FirewallRule)>, RuleStoreError> {
        let stdout = self
            .exec(args(&["status", "numbered"]), RuleIntent::List)
            .await?;
        if is_inactive(&stdout) {
            return Err(RuleStoreError::Rejected {
                intent: RuleIntent::List,
                message: "ufw is inactive, its rules cannot be listed".to_string(),
            });
        }
        Ok(parse_status_numbered(&stdout))
    }
}

#[async_trait]
impl<R: CommandRunner> RuleStore for UfwRuleStore<R> {
    async fn list(&self, label_filter: Option<&str>) -> Result<Vec<FirewallRule>, RuleStoreError> {
        let rules = self.numbered().await?;
        Ok(rules
            .into_iter()
            .map(|(_, rule)| rule)
            .filter(|rule| label_filter.map_or(true, |label| rule.label == label))
            .collect())
    }

    async fn create(&self, rule: &FirewallRule) -> Result<RuleId, RuleStoreError> {
        let intent = RuleIntent::Create(rule.key().to_string());
        let stdout = self.exec(build_allow_args(rule), intent.clone()).await?;
        // ufw matches existing rules without their comment: it either skips
        // the add or rewrites the other rule's comment
        if stdout.contains("Skipping") || stdout.contains("Rule updated") {
            return Err(RuleStoreError::Rejected {
                intent,
                message: format!("rule not created: {}", stdout.trim()),
            });
        }
        Ok(fingerprint(rule))
    }

    async fn delete(&self, id: &RuleId) -> Result<(), RuleStoreError> {
        let intent = RuleIntent::Delete(id.clone());
        let number = self
            .numbered()
            .await?
            .into_iter()
            .find(|(_, rule)| fingerprint(rule) == *id)
            .map(|(number, _)| number)
            .ok_or_else(|| RuleStoreError::NotFound {
                intent: intent.clone(),
            })?;

        self.exec(build_delete_args(number), intent).await?;
        Ok(())
    }

    async fn set_default_policy(&self, policy: DefaultPolicy) -> Result<(), RuleStoreError> {
        let step = format!("setting default incoming policy to {}", policy);
        self.exec(
            args(&["default", &policy.to_string(), "incoming"]),
            RuleIntent::Prepare(step),
        )
        .await?;
        Ok(())
    }

    async fn ensure_enabled(&self) -> Result<(), RuleStoreError> {
        let status = self
            .exec(
                args(&["status", "verbose"]),
                RuleIntent::Prepare("reading ufw status".to_string()),
            )
            .await?;
        if is_active(&status) {
            return Ok(());
        }

        info!("UFW is inactive, enabling it");
        self.exec(
            args(&["--force", "enable"]),
            RuleIntent::Prepare("enabling ufw".to_string()),
        )
        .await?;
        Ok(())
    }
}

fn args(items: &[&str]) -> Vec<String> {
    crate::cmd_abstraction::args_to_strings(items)
}

fn is_active(status: &str) -> bool {
    status
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("status: active"))
}

fn is_inactive(status: &str) -> bool {
    status
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("status: inactive"))
}

/// Stable handle for a rule: what ufw shows for it, minus the rule number.
pub(crate) fn fingerprint(rule: &FirewallRule) -> RuleId {
    RuleId::new(format!(
        "{} ALLOW IN {} # {}",
        port_token(rule.port, rule.protocol),
        rule.cidr,
        rule.label
    ))
}

fn port_token(port: u16, protocol: Protocol) -> String {
    match protocol {
        Protocol::Any => port.to_string(),
        proto => format!("{}/{}", port, proto),
    }
}

/// `ufw allow [proto P] from CIDR to any port N comment LABEL`
pub(crate) fn build_allow_args(rule: &FirewallRule) -> Vec<String> {
    let mut out = vec!["allow".to_string()];
    if rule.protocol != Protocol::Any {
        out.push("proto".to_string());
        out.push(rule.protocol.to_string());
    }
    out.extend([
        "from".to_string(),
        rule.cidr.to_string(),
        "to".to_string(),
        "any".to_string(),
        "port".to_string(),
        rule.port.to_string(),
        "comment".to_string(),
        rule.label.clone(),
    ]);
    out
}

pub(crate) fn build_delete_args(number: usize) -> Vec<String> {
    vec!["--force".to_string(), "delete".to_string(), number.to_string()]
}

/// Parse every inbound port allow rule from `ufw status numbered`.
///
/// Lines that are not of that shape (deny, limit, route, multiport, rules
/// from Anywhere) are skipped; they can never be owned rules.
pub(crate) fn parse_status_numbered(output: &str) -> Vec<(usize, FirewallRule)> {
    output
        .lines()
        .filter_map(|line| {
            let parsed = parse_numbered_line(line);
            if parsed.is_none() && line.trim_start().starts_with('[') {
                debug!("Not a managed rule shape, skipping: {}", line.trim());
            }
            parsed
        })
        .collect()
}

/// Parse one `[ N] 443/tcp   ALLOW IN   1.0.0.0/24   # label` line.
pub(crate) fn parse_numbered_line(line: &str) -> Option<(usize, FirewallRule)> {
    let rest = line.trim_start().strip_prefix('[')?;
    let (number, rest) = rest.split_once(']')?;
    let number = number.trim().parse::<usize>().ok()?;

    let (body, label) = match rest.split_once('#') {
        Some((body, comment)) => (body, comment.trim().to_string()),
        None => (rest, String::new()),
    };

    let tokens: Vec<&str> = body
        .split_whitespace()
        .filter(|t| *t != "(v6)")
        .collect();
    let (to, action, from) = match tokens.as_slice() {
        [to, action, "IN", from] | [to, action, from] => (*to, *action, *from),
        _ => return None,
    };
    if action != "ALLOW" {
        return None;
    }

    let (port, protocol) = match to.split_once('/') {
        Some((port, proto)) => (port, proto.parse::<Protocol>().ok()?),
        None => (to, Protocol::Any),
    };
    let port = port.parse::<u16>().ok()?;
    let range = IpRange::parse(from).ok()?;

    let mut rule = FirewallRule {
        id: None,
        cidr: range.net(),
        port,
        protocol,
        label,
        direction: Direction::Inbound,
    };
    rule.id = Some(fingerprint(&rule));
    Some((number, rule))
}
