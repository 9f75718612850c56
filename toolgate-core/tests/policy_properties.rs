//! Property tests for the policy engine's ordering guarantees.

use proptest::prelude::*;
use serde_json::json;

use toolgate_core::auth::CallerContext;
use toolgate_core::policy::{Policy, PolicyEngine, PolicyRule, RuleAction};

fn caller(roles: &[&str]) -> CallerContext {
    CallerContext {
        consumer_id: "c".into(),
        credential_id: "k".into(),
        roles: roles.iter().map(|r| (*r).to_string()).collect(),
        rate_limit_per_minute: None,
        email: None,
        metadata: None,
    }
}

fn engine_for(rules: Vec<PolicyRule>) -> PolicyEngine {
    PolicyEngine::new(vec![Policy {
        id: "p".into(),
        name: "p".into(),
        roles: vec!["r".into()],
        rules,
    }])
}

fn specificity(rule: &PolicyRule) -> u8 {
    let set = |g: &Option<String>| u8::from(g.as_deref().is_some_and(|p| p != "*"));
    set(&rule.server) + set(&rule.tool)
}

/// Glob pool mixing wildcards, prefixes, suffixes, and exact values.
fn glob_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("*".to_string())),
        Just(Some("pay".to_string())),
        Just(Some("p*".to_string())),
        Just(Some("*y".to_string())),
        Just(Some("get_*".to_string())),
        Just(Some("get_x".to_string())),
        Just(Some("*_x".to_string())),
    ]
}

/// Rules whose action is a function of their specificity, so every pair of
/// equal-specificity rules carries the same action and reordering them
/// cannot change any decision.
fn specificity_keyed_rule() -> impl Strategy<Value = PolicyRule> {
    (glob_strategy(), glob_strategy()).prop_map(|(server, tool)| {
        let mut rule = PolicyRule {
            server,
            tool,
            action: RuleAction::Allow,
            conditions: Vec::new(),
        };
        rule.action = match specificity(&rule) {
            1 => RuleAction::Deny,
            _ => RuleAction::Allow,
        };
        rule
    })
}

proptest! {
    /// Permuting rules with equal specificity never changes decisions: the
    /// specificity sort is the only ordering that matters.
    #[test]
    fn permuting_equal_specificity_rules_is_decision_invariant(
        rules in proptest::collection::vec(specificity_keyed_rule(), 1..6),
        rotation in 0usize..6,
        server in prop_oneof![Just("pay"), Just("py"), Just("ledger")],
        tool in prop_oneof![Just("get_x"), Just("get_series"), Just("put_x"), Just("drop")],
    ) {
        let mut rotated = rules.clone();
        rotated.rotate_left(rotation % rules.len());
        let mut reversed = rules.clone();
        reversed.reverse();

        let c = caller(&["r"]);
        let args = json!({});
        let baseline = engine_for(rules).evaluate(&c, server, tool, &args);
        for variant in [rotated, reversed] {
            let decision = engine_for(variant).evaluate(&c, server, tool, &args);
            prop_assert_eq!(decision.allowed, baseline.allowed);
        }
    }

    /// A caller with an empty role set is denied by every rule set.
    #[test]
    fn empty_role_set_is_always_denied(
        rules in proptest::collection::vec(specificity_keyed_rule(), 0..6),
        server in prop_oneof![Just("pay"), Just("ledger")],
        tool in prop_oneof![Just("get_x"), Just("drop")],
    ) {
        let decision = engine_for(rules).evaluate(&caller(&[]), server, tool, &json!({}));
        prop_assert!(!decision.allowed);
        prop_assert_eq!(decision.reason.as_deref(), Some("No matching rule"));
    }

    /// A rule scoped to a server the request does not touch never affects
    /// the decision.
    #[test]
    fn out_of_scope_rules_are_inert(
        rules in proptest::collection::vec(specificity_keyed_rule(), 1..5),
        tool in prop_oneof![Just("get_x"), Just("drop")],
    ) {
        let inert = PolicyRule {
            server: Some("unrelated-server".to_string()),
            tool: None,
            action: RuleAction::Deny,
            conditions: Vec::new(),
        };
        let mut with_inert = rules.clone();
        with_inert.push(inert);

        let c = caller(&["r"]);
        let args = json!({});
        let baseline = engine_for(rules).evaluate(&c, "ledger", tool, &args);
        let decision = engine_for(with_inert).evaluate(&c, "ledger", tool, &args);
        prop_assert_eq!(decision.allowed, baseline.allowed);
    }
}
