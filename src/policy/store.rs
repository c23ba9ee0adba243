//! Atomically replaceable policy snapshot.

use arc_swap::ArcSwap;
use std::sync::Arc;

use super::Policy;

/// Holder for the active [`Policy`].
///
/// Readers take a snapshot with [`load`](Self::load) and finish against it
/// even if a reload lands mid-evaluation. Replacement is wholesale.
#[derive(Debug)]
pub struct PolicyStore {
    active: ArcSwap<Policy>,
}

impl PolicyStore {
    pub fn new(policy: Policy) -> Self {
        Self {
            active: ArcSwap::new(Arc::new(policy)),
        }
    }

    pub fn load(&self) -> Arc<Policy> {
        self.active.load_full()
    }

    pub fn replace(&self, policy: Policy) {
        let rules = policy.engine().rule_count();
        self.active.store(Arc::new(policy));
        tracing::info!(rules, "policy_replaced");
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Effect, PolicyRule};

    #[test]
    fn test_snapshot_survives_replace() {
        let store = PolicyStore::new(Policy::new(
            vec![PolicyRule::allow("user", "invoke", "echo")],
            Effect::Deny,
        ));

        let before = store.load();
        store.replace(Policy::default());
        let after = store.load();

        assert!(before.is_allowed(&["user"], "invoke", "echo"));
        assert!(!after.is_allowed(&["user"], "invoke", "echo"));
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let store = Arc::new(PolicyStore::default());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let policy = store.load();
                    // Each snapshot is either the empty default or the 2-rule set.
                    let n = policy.engine().rule_count();
                    assert!(n == 0 || n == 2);
                }
            }));
        }

        for _ in 0..100 {
            store.replace(Policy::new(
                vec![
                    PolicyRule::allow("a", "*", "*"),
                    PolicyRule::deny("b", "*", "*"),
                ],
                Effect::Deny,
            ));
            store.replace(Policy::default());
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
