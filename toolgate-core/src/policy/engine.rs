//! Default-deny RBAC evaluation with specificity ordering.
//!
//! The engine holds the active policy set behind an [`ArcSwap`] so a
//! configuration reload swaps the whole set atomically: an in-flight
//! evaluation keeps the snapshot it loaded and never observes a half-applied
//! reload.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::CallerContext;

use super::{ConditionOp, Policy, PolicyRule, RuleAction, glob_matches, rule_specificity};

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Why the call was refused (or a trace of the allowing rule).
    pub reason: Option<String>,
    /// `policy-id/rule-index` of the deciding rule, when one matched.
    pub matched_rule: Option<String>,
}

impl PolicyDecision {
    fn allow(matched: String) -> Self {
        Self {
            allowed: true,
            reason: None,
            matched_rule: Some(matched),
        }
    }

    fn deny(reason: String, matched: Option<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            matched_rule: matched,
        }
    }
}

/// Runtime counters for the engine.
#[derive(Debug, Clone, Copy)]
pub struct PolicyStats {
    /// Number of policies in the active set.
    pub policy_count: usize,
    /// Total evaluations since construction.
    pub evaluation_count: u64,
    /// Successful reloads since construction.
    pub reload_count: u64,
}

/// Glob-matched, specificity-ordered, default-deny policy engine.
pub struct PolicyEngine {
    policies: ArcSwap<Vec<Policy>>,
    evaluation_count: AtomicU64,
    reload_count: AtomicU64,
}

impl PolicyEngine {
    /// Create an engine over the given policy set.
    pub fn new(policies: Vec<Policy>) -> Self {
        info!(policy_count = policies.len(), "policy engine initialized");
        Self {
            policies: ArcSwap::new(Arc::new(policies)),
            evaluation_count: AtomicU64::new(0),
            reload_count: AtomicU64::new(0),
        }
    }

    /// Atomically replace the active policy set.
    pub fn reload(&self, policies: Vec<Policy>) {
        let count = policies.len();
        self.policies.store(Arc::new(policies));
        self.reload_count.fetch_add(1, Ordering::Relaxed);
        info!(policy_count = count, "policy set reloaded");
    }

    /// Decide whether `caller` may invoke `tool` on `server_id` with `args`.
    ///
    /// Walks the rules of every policy whose roles intersect the caller's,
    /// filtered by server/tool globs, sorted by specificity descending
    /// (stable, so configuration order breaks ties), gated by argument
    /// conditions. The first surviving rule decides; no rule means deny.
    pub fn evaluate(
        &self,
        caller: &CallerContext,
        server_id: &str,
        tool: &str,
        args: &Value,
    ) -> PolicyDecision {
        self.evaluation_count.fetch_add(1, Ordering::Relaxed);
        let policies = self.policies.load();

        // (policy, rule index, rule) for every in-scope rule, in
        // policy-then-rule order so the stable sort preserves it.
        let mut candidates: Vec<(&Policy, usize, &PolicyRule)> = Vec::new();
        for policy in policies.iter() {
            if !roles_intersect(&policy.roles, &caller.roles) {
                continue;
            }
            for (idx, rule) in policy.rules.iter().enumerate() {
                if !glob_matches(rule.server.as_deref(), server_id) {
                    continue;
                }
                if !glob_matches(rule.tool.as_deref(), tool) {
                    continue;
                }
                candidates.push((policy, idx, rule));
            }
        }

        candidates.sort_by(|a, b| rule_specificity(b.2).cmp(&rule_specificity(a.2)));

        for (policy, idx, rule) in candidates {
            if !conditions_hold(&rule.conditions, args) {
                continue;
            }
            let matched = format!("{}/{}", policy.id, idx);
            return match rule.action {
                RuleAction::Allow => {
                    debug!(
                        consumer_id = %caller.consumer_id,
                        server_id,
                        tool,
                        rule = %matched,
                        "policy allow"
                    );
                    PolicyDecision::allow(matched)
                }
                RuleAction::Deny => {
                    debug!(
                        consumer_id = %caller.consumer_id,
                        server_id,
                        tool,
                        rule = %matched,
                        "policy deny"
                    );
                    PolicyDecision::deny(
                        format!("Denied by policy '{}' rule {}", policy.name, idx),
                        Some(matched),
                    )
                }
            };
        }

        debug!(
            consumer_id = %caller.consumer_id,
            server_id,
            tool,
            "policy default deny"
        );
        PolicyDecision::deny("No matching rule".to_string(), None)
    }

    /// Runtime counters.
    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            policy_count: self.policies.load().len(),
            evaluation_count: self.evaluation_count.load(Ordering::Relaxed),
            reload_count: self.reload_count.load(Ordering::Relaxed),
        }
    }
}

/// A policy role of `"*"` matches any caller; otherwise the sets must share
/// at least one role.
fn roles_intersect(policy_roles: &[String], caller_roles: &[String]) -> bool {
    policy_roles
        .iter()
        .any(|r| r == "*" || caller_roles.iter().any(|c| c == r))
}

/// Every condition must hold. An absent argument fails its condition, and an
/// invalid regex fails closed.
fn conditions_hold(conditions: &[super::RuleCondition], args: &Value) -> bool {
    conditions.iter().all(|cond| {
        let Some(actual) = args.get(&cond.param) else {
            return false;
        };
        match cond.op {
            ConditionOp::Eq => coerce(actual) == coerce(&cond.value),
            ConditionOp::Neq => coerce(actual) != coerce(&cond.value),
            ConditionOp::In => match cond.value.as_array() {
                Some(items) => items.iter().any(|item| coerce(item) == coerce(actual)),
                None => false,
            },
            ConditionOp::Regex => {
                let Some(pattern) = cond.value.as_str() else {
                    return false;
                };
                match regex::Regex::new(pattern) {
                    Ok(re) => re.is_match(&coerce(actual)),
                    Err(e) => {
                        warn!(param = %cond.param, error = %e, "invalid condition regex, failing closed");
                        false
                    }
                }
            }
        }
    })
}

/// String coercion used by eq/neq/in: strings compare by content, everything
/// else by its JSON rendering.
fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::policy::RuleCondition;

    fn caller(roles: &[&str]) -> CallerContext {
        CallerContext {
            consumer_id: "c1".into(),
            credential_id: "k1".into(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            rate_limit_per_minute: None,
            email: None,
            metadata: None,
        }
    }

    fn rule(server: Option<&str>, tool: Option<&str>, action: RuleAction) -> PolicyRule {
        PolicyRule {
            server: server.map(String::from),
            tool: tool.map(String::from),
            action,
            conditions: Vec::new(),
        }
    }

    fn policy(id: &str, roles: &[&str], rules: Vec<PolicyRule>) -> Policy {
        Policy {
            id: id.into(),
            name: id.into(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            rules,
        }
    }

    #[test]
    fn test_default_deny_with_no_policies() {
        let engine = PolicyEngine::new(vec![]);
        let d = engine.evaluate(&caller(&["admin"]), "s", "t", &json!({}));
        assert!(!d.allowed);
        assert_eq!(d.reason.as_deref(), Some("No matching rule"));
        assert!(d.matched_rule.is_none());
    }

    #[test]
    fn test_default_deny_with_empty_role_set() {
        let engine = PolicyEngine::new(vec![policy(
            "p1",
            &["reader"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        let d = engine.evaluate(&caller(&[]), "s", "t", &json!({}));
        assert!(!d.allowed);
    }

    #[test]
    fn test_reader_allowed_on_get_denied_on_delete() {
        let engine = PolicyEngine::new(vec![policy(
            "reader",
            &["reader"],
            vec![
                rule(None, Some("get_*"), RuleAction::Allow),
                rule(None, Some("*"), RuleAction::Deny),
            ],
        )]);
        let c = caller(&["reader"]);
        assert!(engine.evaluate(&c, "server-A", "get_series", &json!({})).allowed);

        let d = engine.evaluate(&c, "server-A", "delete_x", &json!({}));
        assert!(!d.allowed);
        assert_eq!(d.matched_rule.as_deref(), Some("reader/1"));
        assert!(d.reason.unwrap().contains("reader"));
    }

    #[test]
    fn test_admin_wildcard_full_access() {
        let engine = PolicyEngine::new(vec![policy(
            "admin",
            &["admin"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        let d = engine.evaluate(&caller(&["admin"]), "anywhere", "delete_anything", &json!({}));
        assert!(d.allowed);
    }

    #[test]
    fn test_star_role_matches_any_caller() {
        let engine = PolicyEngine::new(vec![policy(
            "open",
            &["*"],
            vec![rule(None, Some("ping"), RuleAction::Allow)],
        )]);
        assert!(engine.evaluate(&caller(&["whatever"]), "s", "ping", &json!({})).allowed);
    }

    #[test]
    fn test_server_restriction_beats_wildcard_allow() {
        // Specificity 1 deny on server "pay" outranks the specificity 0
        // wildcard allow, regardless of policy order.
        let engine = PolicyEngine::new(vec![
            policy("reader", &["reader"], vec![rule(None, Some("*"), RuleAction::Allow)]),
            policy(
                "no-pay",
                &["reader"],
                vec![rule(Some("pay"), Some("*"), RuleAction::Deny)],
            ),
        ]);
        let c = caller(&["reader"]);
        let d = engine.evaluate(&c, "pay", "get_x", &json!({}));
        assert!(!d.allowed);
        assert_eq!(d.matched_rule.as_deref(), Some("no-pay/0"));
        // Other servers still pass through the wildcard allow.
        assert!(engine.evaluate(&c, "ledger", "get_x", &json!({})).allowed);
    }

    #[test]
    fn test_equal_specificity_resolved_by_declaration_order() {
        let engine = PolicyEngine::new(vec![policy(
            "p",
            &["r"],
            vec![
                rule(None, Some("x*"), RuleAction::Deny),
                rule(None, Some("xy*"), RuleAction::Allow),
            ],
        )]);
        // Both rules have specificity 1 and both match "xyz"; the first
        // declared rule wins.
        let d = engine.evaluate(&caller(&["r"]), "s", "xyz", &json!({}));
        assert!(!d.allowed);
        assert_eq!(d.matched_rule.as_deref(), Some("p/0"));
    }

    #[test]
    fn test_condition_eq_gates_rule() {
        let mut allow = rule(None, Some("deploy"), RuleAction::Allow);
        allow.conditions = vec![RuleCondition {
            param: "env".into(),
            op: ConditionOp::Eq,
            value: json!("staging"),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["ops"], vec![allow])]);
        let c = caller(&["ops"]);

        assert!(engine.evaluate(&c, "s", "deploy", &json!({"env": "staging"})).allowed);
        // Wrong value: the rule is skipped, so default deny applies.
        let d = engine.evaluate(&c, "s", "deploy", &json!({"env": "prod"}));
        assert!(!d.allowed);
        assert_eq!(d.reason.as_deref(), Some("No matching rule"));
        // Absent parameter fails the condition.
        assert!(!engine.evaluate(&c, "s", "deploy", &json!({})).allowed);
    }

    #[test]
    fn test_condition_eq_coerces_numbers() {
        let mut allow = rule(None, None, RuleAction::Allow);
        allow.conditions = vec![RuleCondition {
            param: "count".into(),
            op: ConditionOp::Eq,
            value: json!("5"),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["r"], vec![allow])]);
        assert!(engine
            .evaluate(&caller(&["r"]), "s", "t", &json!({"count": 5}))
            .allowed);
    }

    #[test]
    fn test_condition_neq() {
        let mut allow = rule(None, None, RuleAction::Allow);
        allow.conditions = vec![RuleCondition {
            param: "env".into(),
            op: ConditionOp::Neq,
            value: json!("prod"),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["r"], vec![allow])]);
        let c = caller(&["r"]);
        assert!(engine.evaluate(&c, "s", "t", &json!({"env": "dev"})).allowed);
        assert!(!engine.evaluate(&c, "s", "t", &json!({"env": "prod"})).allowed);
    }

    #[test]
    fn test_condition_in_requires_array() {
        let mut allow = rule(None, None, RuleAction::Allow);
        allow.conditions = vec![RuleCondition {
            param: "region".into(),
            op: ConditionOp::In,
            value: json!(["eu", "us"]),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["r"], vec![allow])]);
        let c = caller(&["r"]);
        assert!(engine.evaluate(&c, "s", "t", &json!({"region": "eu"})).allowed);
        assert!(!engine.evaluate(&c, "s", "t", &json!({"region": "ap"})).allowed);

        // Non-array value for `in` never matches.
        let mut bad = rule(None, None, RuleAction::Allow);
        bad.conditions = vec![RuleCondition {
            param: "region".into(),
            op: ConditionOp::In,
            value: json!("eu"),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["r"], vec![bad])]);
        assert!(!engine.evaluate(&c, "s", "t", &json!({"region": "eu"})).allowed);
    }

    #[test]
    fn test_condition_regex_and_fail_closed() {
        let mut allow = rule(None, None, RuleAction::Allow);
        allow.conditions = vec![RuleCondition {
            param: "path".into(),
            op: ConditionOp::Regex,
            value: json!("^/tmp/"),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["r"], vec![allow])]);
        let c = caller(&["r"]);
        assert!(engine.evaluate(&c, "s", "t", &json!({"path": "/tmp/x"})).allowed);
        assert!(!engine.evaluate(&c, "s", "t", &json!({"path": "/etc/x"})).allowed);

        // Invalid pattern fails closed.
        let mut broken = rule(None, None, RuleAction::Allow);
        broken.conditions = vec![RuleCondition {
            param: "path".into(),
            op: ConditionOp::Regex,
            value: json!("("),
        }];
        let engine = PolicyEngine::new(vec![policy("p", &["r"], vec![broken])]);
        assert!(!engine.evaluate(&c, "s", "t", &json!({"path": "/tmp/x"})).allowed);
    }

    #[test]
    fn test_reload_swaps_atomically() {
        let engine = PolicyEngine::new(vec![policy(
            "p",
            &["r"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        let c = caller(&["r"]);
        assert!(engine.evaluate(&c, "s", "t", &json!({})).allowed);

        engine.reload(vec![policy(
            "p",
            &["r"],
            vec![rule(None, None, RuleAction::Deny)],
        )]);
        assert!(!engine.evaluate(&c, "s", "t", &json!({})).allowed);

        let stats = engine.stats();
        assert_eq!(stats.reload_count, 1);
        assert_eq!(stats.evaluation_count, 2);
        assert_eq!(stats.policy_count, 1);
    }

    #[test]
    fn test_policy_for_other_role_is_ignored() {
        let engine = PolicyEngine::new(vec![policy(
            "admin",
            &["admin"],
            vec![rule(None, None, RuleAction::Allow)],
        )]);
        assert!(!engine.evaluate(&caller(&["reader"]), "s", "t", &json!({})).allowed);
    }
}
