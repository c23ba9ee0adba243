//! Role-based access policy.
//!
//! A rule maps a `(role, action, resource)` triple to an [`Effect`]. Any of
//! the three fields may be the wildcard `*`. The [`PolicyEngine`] answers
//! for a single role and never invents a default; [`Policy`] pairs an engine
//! with the configured default and combines a principal's roles.

mod engine;
mod store;

pub use engine::PolicyEngine;
pub use store::PolicyStore;

use serde::{Deserialize, Serialize};

/// Matches any role, action, or resource.
pub const WILDCARD: &str = "*";

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// A single access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub role: String,
    pub action: String,
    pub resource: String,
    pub effect: Effect,
    /// Higher is evaluated first. Equal priorities keep insertion order.
    #[serde(default)]
    pub priority: i32,
}

impl PolicyRule {
    fn with_effect(role: &str, action: &str, resource: &str, effect: Effect) -> Self {
        Self {
            role: role.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            effect,
            priority: 0,
        }
    }

    pub fn allow(role: &str, action: &str, resource: &str) -> Self {
        Self::with_effect(role, action, resource, Effect::Allow)
    }

    pub fn deny(role: &str, action: &str, resource: &str) -> Self {
        Self::with_effect(role, action, resource, Effect::Deny)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn matches(&self, role: &str, action: &str, resource: &str) -> bool {
        field_matches(&self.role, role)
            && field_matches(&self.action, action)
            && field_matches(&self.resource, resource)
    }

    /// Reject rules with empty fields.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (field, value) in [
            ("role", &self.role),
            ("action", &self.action),
            ("resource", &self.resource),
        ] {
            if value.is_empty() {
                return Err(format!("{field} must not be empty"));
            }
        }
        Ok(())
    }
}

fn field_matches(pattern: &str, value: &str) -> bool {
    pattern == WILDCARD || pattern == value
}

/// Outcome of evaluating one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allowed,
    Denied,
    NoMatch,
}

impl PolicyDecision {
    /// Collapse to an effect, using `default` for `NoMatch`.
    pub fn resolve(self, default: Effect) -> Effect {
        match self {
            PolicyDecision::Allowed => Effect::Allow,
            PolicyDecision::Denied => Effect::Deny,
            PolicyDecision::NoMatch => default,
        }
    }
}

/// An engine plus the effect applied when nothing matches.
#[derive(Debug, Clone)]
pub struct Policy {
    engine: PolicyEngine,
    default_effect: Effect,
}

impl Policy {
    pub fn new(rules: Vec<PolicyRule>, default_effect: Effect) -> Self {
        Self {
            engine: PolicyEngine::new(rules),
            default_effect,
        }
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn default_effect(&self) -> Effect {
        self.default_effect
    }

    /// Decide for a principal holding `roles`.
    ///
    /// Any role denied wins. Otherwise any role allowed wins. Otherwise the
    /// default applies. A principal with no roles gets the default.
    pub fn decide<R: AsRef<str>>(&self, roles: &[R], action: &str, resource: &str) -> Effect {
        let mut allowed = false;
        for role in roles {
            match self.engine.evaluate(role.as_ref(), action, resource) {
                PolicyDecision::Denied => return Effect::Deny,
                PolicyDecision::Allowed => allowed = true,
                PolicyDecision::NoMatch => {}
            }
        }
        if allowed {
            Effect::Allow
        } else {
            self.default_effect
        }
    }

    pub fn is_allowed<R: AsRef<str>>(&self, roles: &[R], action: &str, resource: &str) -> bool {
        self.decide(roles, action, resource) == Effect::Allow
    }
}

impl Default for Policy {
    /// No rules, default deny.
    fn default() -> Self {
        Self::new(Vec::new(), Effect::Deny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_validation() {
        assert!(PolicyRule::allow("admin", "*", "*").validate().is_ok());
        assert_eq!(
            PolicyRule::deny("user", "", "config").validate().unwrap_err(),
            "action must not be empty"
        );
    }

    #[test]
    fn test_resolve_uses_default_only_for_no_match() {
        assert_eq!(PolicyDecision::Allowed.resolve(Effect::Deny), Effect::Allow);
        assert_eq!(PolicyDecision::Denied.resolve(Effect::Allow), Effect::Deny);
        assert_eq!(PolicyDecision::NoMatch.resolve(Effect::Allow), Effect::Allow);
    }

    #[test]
    fn test_empty_rules_default_deny() {
        let policy = Policy::default();
        assert_eq!(policy.decide(&["admin"], "read", "config"), Effect::Deny);
        assert_eq!(policy.decide(&["guest"], "invoke", "echo"), Effect::Deny);
    }

    #[test]
    fn test_multi_role_deny_overrides() {
        let policy = Policy::new(
            vec![
                PolicyRule::allow("operator", "invoke", "*"),
                PolicyRule::deny("restricted", "invoke", "shell"),
            ],
            Effect::Deny,
        );

        assert!(policy.is_allowed(&["operator"], "invoke", "shell"));
        assert!(!policy.is_allowed(&["operator", "restricted"], "invoke", "shell"));
        assert!(policy.is_allowed(&["operator", "restricted"], "invoke", "echo"));
    }

    #[test]
    fn test_no_roles_gets_default() {
        let roles: [&str; 0] = [];
        let allow_all = Policy::new(Vec::new(), Effect::Allow);
        assert_eq!(allow_all.decide(&roles, "read", "x"), Effect::Allow);
        assert_eq!(Policy::default().decide(&roles, "read", "x"), Effect::Deny);
    }

    #[test]
    fn test_rule_deserializes_with_default_priority() {
        let rule: PolicyRule = serde_json::from_value(serde_json::json!({
            "role": "user", "action": "invoke", "resource": "echo", "effect": "allow"
        }))
        .unwrap();
        assert_eq!(rule, PolicyRule::allow("user", "invoke", "echo"));
    }
}
