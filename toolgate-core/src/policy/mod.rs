//! Role-based policy types and the evaluation engine.
//!
//! A policy binds a set of roles to an ordered list of allow/deny rules.
//! Rules scope by server and tool globs and may gate on argument conditions.
//! Evaluation is default-deny: a caller with no matching rule is refused.

mod engine;

pub use engine::{PolicyDecision, PolicyEngine, PolicyStats};

use serde::{Deserialize, Serialize};

/// A named, role-scoped rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy identifier.
    pub id: String,
    /// Human-readable name, used in denial reasons.
    pub name: String,
    /// Roles this policy applies to. `"*"` matches any caller.
    pub roles: Vec<String>,
    /// Rules in declaration order; order breaks specificity ties.
    pub rules: Vec<PolicyRule>,
}

/// One allow/deny clause inside a policy.
///
/// An absent glob counts as `"*"`. Specificity is the number of globs that
/// are present and not `"*"` (0..=2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Server glob: `*`, `PREFIX*`, `*SUFFIX`, or exact id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Tool glob, same grammar as `server`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Whether a match allows or denies the call.
    pub action: RuleAction,
    /// Argument conditions; every one must hold for the rule to match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RuleCondition>,
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Permit the call.
    Allow,
    /// Refuse the call.
    Deny,
}

/// A predicate over one call argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Argument name to inspect. An absent argument fails the condition.
    pub param: String,
    /// Comparison operator.
    pub op: ConditionOp,
    /// Comparison value. `in` requires an array; the others compare the
    /// string-coerced argument.
    pub value: serde_json::Value,
}

/// Condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    /// String-coerced equality.
    Eq,
    /// String-coerced inequality.
    Neq,
    /// Membership in an array value.
    In,
    /// Regular-expression match. An invalid pattern fails closed.
    Regex,
}

/// Match a value against the rule glob grammar.
///
/// `*` matches everything; `PREFIX*` is a prefix match; `*SUFFIX` is a
/// suffix match; anything else is equality. `None` counts as `*`.
pub(crate) fn glob_matches(pattern: Option<&str>, value: &str) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return value.starts_with(prefix);
        }
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.contains('*') {
            return value.ends_with(suffix);
        }
    }
    pattern == value
}

/// Specificity of a rule: one point per glob that is set and not `*`.
pub(crate) fn rule_specificity(rule: &PolicyRule) -> u8 {
    let counts = |g: &Option<String>| u8::from(g.as_deref().is_some_and(|p| p != "*"));
    counts(&rule.server) + counts(&rule.tool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_star_matches_everything() {
        assert!(glob_matches(Some("*"), "anything"));
        assert!(glob_matches(Some("*"), ""));
        assert!(glob_matches(None, "anything"));
    }

    #[test]
    fn test_glob_prefix() {
        assert!(glob_matches(Some("get_*"), "get_series"));
        assert!(!glob_matches(Some("get_*"), "delete_series"));
        assert!(glob_matches(Some("get_*"), "get_"));
    }

    #[test]
    fn test_glob_suffix() {
        assert!(glob_matches(Some("*_prod"), "db_prod"));
        assert!(!glob_matches(Some("*_prod"), "db_staging"));
    }

    #[test]
    fn test_glob_exact() {
        assert!(glob_matches(Some("pay"), "pay"));
        assert!(!glob_matches(Some("pay"), "payments"));
    }

    #[test]
    fn test_specificity_counts_non_star_globs() {
        let rule = |server: Option<&str>, tool: Option<&str>| PolicyRule {
            server: server.map(String::from),
            tool: tool.map(String::from),
            action: RuleAction::Allow,
            conditions: Vec::new(),
        };
        assert_eq!(rule_specificity(&rule(None, None)), 0);
        assert_eq!(rule_specificity(&rule(Some("*"), Some("*"))), 0);
        assert_eq!(rule_specificity(&rule(Some("pay"), Some("*"))), 1);
        assert_eq!(rule_specificity(&rule(Some("pay"), Some("get_*"))), 2);
    }
}
