//! Priority-ordered rule evaluation.

use std::collections::BTreeSet;

use super::{Effect, PolicyDecision, PolicyRule, WILDCARD};

/// Immutable, pre-sorted rule set.
///
/// Rules are ordered once at construction (priority descending, stable), so
/// evaluation is a linear scan with no allocation and no interior mutability.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(mut rules: Vec<PolicyRule>) -> Self {
        // sort_by is stable: equal priorities keep configuration order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// First matching rule wins. Returns `NoMatch` if none applies.
    pub fn evaluate(&self, role: &str, action: &str, resource: &str) -> PolicyDecision {
        let decision = self
            .rules
            .iter()
            .find(|rule| rule.matches(role, action, resource))
            .map_or(PolicyDecision::NoMatch, |rule| match rule.effect {
                Effect::Allow => PolicyDecision::Allowed,
                Effect::Deny => PolicyDecision::Denied,
            });

        tracing::trace!(role, action, resource, ?decision, "policy_evaluated");
        decision
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Distinct non-wildcard roles named by any rule, sorted.
    pub fn roles(&self) -> Vec<&str> {
        self.rules
            .iter()
            .map(|r| r.role.as_str())
            .filter(|r| *r != WILDCARD)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}
