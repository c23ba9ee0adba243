//! Plugin hook dispatch.
//!
//! Hooks subscribe to named events. Dispatch runs every hook registered for
//! the event in descending priority (registration order among equals),
//! collecting failures instead of stopping at the first one.
//!
//! The table is copy-on-write: registration publishes a new immutable
//! snapshot, and a dispatch iterates whichever snapshot it loaded.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::types::{Error, HookId, Result};

/// Event names the kernel dispatches.
pub mod events {
    pub const MESSAGE_INBOUND: &str = "message.inbound";
    pub const SKILL_COMPLETED: &str = "skill.completed";
    pub const SKILL_FAILED: &str = "skill.failed";
    pub const CONFIG_RELOADED: &str = "config.reloaded";
}

#[async_trait]
pub trait Hook: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn call(&self, event: &str, args: &serde_json::Value) -> Result<()>;
}

type HookFn = dyn Fn(String, serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Hook backed by a closure.
#[derive(Clone)]
pub struct FnHook {
    name: String,
    f: Arc<HookFn>,
}

impl FnHook {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String, serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, event: &str, args: &serde_json::Value) -> Result<()> {
        (self.f)(event.to_string(), args.clone()).await
    }
}

/// Discovery metadata a plugin registers alongside its hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Input names the plugin accepts.
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[derive(Debug)]
struct RegisteredHook {
    id: HookId,
    event: String,
    priority: i32,
    hook: Arc<dyn Hook>,
}

#[derive(Debug, Clone, Default)]
struct HookTable {
    by_event: HashMap<String, Vec<Arc<RegisteredHook>>>,
    plugins: BTreeMap<String, PluginInfo>,
}

/// One hook that returned an error (or panicked) during dispatch.
#[derive(Debug)]
pub struct HookFailure {
    pub hook_id: HookId,
    pub hook: String,
    pub error: Error,
}

/// Outcome of dispatching one event.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Hook names in the order they ran.
    pub ran: Vec<String>,
    pub failures: Vec<HookFailure>,
}

impl DispatchReport {
    pub fn handlers_run(&self) -> usize {
        self.ran.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registered hooks and plugins.
#[derive(Debug, Default)]
pub struct HookRegistry {
    table: ArcSwap<HookTable>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `hook` to `event` at `priority` (higher runs first).
    pub fn register_hook(&self, event: &str, priority: i32, hook: Arc<dyn Hook>) -> HookId {
        let entry = Arc::new(RegisteredHook {
            id: HookId::new(),
            event: event.to_string(),
            priority,
            hook,
        });
        let id = entry.id.clone();

        self.table.rcu(|current| {
            let mut next = HookTable::clone(current);
            let hooks = next.by_event.entry(event.to_string()).or_default();
            // After every hook with priority >= ours: descending, FIFO among equals.
            let pos = hooks.partition_point(|h| h.priority >= priority);
            hooks.insert(pos, Arc::clone(&entry));
            next
        });

        tracing::debug!(event, priority, hook = entry.hook.name(), hook_id = %id, "hook_registered");
        id
    }

    /// Remove a hook. Returns whether it was registered.
    pub fn unregister(&self, hook_id: &HookId) -> bool {
        let previous = self.table.rcu(|current| {
            let mut next = HookTable::clone(current);
            for hooks in next.by_event.values_mut() {
                hooks.retain(|h| &h.id != hook_id);
            }
            next.by_event.retain(|_, hooks| !hooks.is_empty());
            next
        });
        let found = previous
            .by_event
            .values()
            .flatten()
            .any(|h| &h.id == hook_id);
        if found {
            tracing::debug!(hook_id = %hook_id, "hook_unregistered");
        }
        found
    }

    pub fn register_plugin(&self, info: PluginInfo) -> Result<()> {
        if info.name.is_empty() {
            return Err(Error::validation("plugin name must not be empty"));
        }
        let mut duplicate = false;
        self.table.rcu(|current| {
            duplicate = current.plugins.contains_key(&info.name);
            let mut next = HookTable::clone(current);
            if !duplicate {
                next.plugins.insert(info.name.clone(), info.clone());
            }
            next
        });
        if duplicate {
            return Err(Error::duplicate_name(format!("plugin {}", info.name)));
        }
        tracing::info!(plugin = %info.name, version = %info.version, "plugin_registered");
        Ok(())
    }

    pub fn plugin(&self, name: &str) -> Option<PluginInfo> {
        self.table.load().plugins.get(name).cloned()
    }

    /// All plugins, sorted by name.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.table.load().plugins.values().cloned().collect()
    }

    pub fn hook_count(&self) -> usize {
        self.table.load().by_event.values().map(Vec::len).sum()
    }

    /// Hook names for `event` in dispatch order.
    pub fn hooks_for(&self, event: &str) -> Vec<String> {
        self.table
            .load()
            .by_event
            .get(event)
            .map(|hooks| hooks.iter().map(|h| h.hook.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Run every hook for `event`. Failures are recorded, never propagated.
    pub async fn dispatch(&self, event: &str, args: &serde_json::Value) -> DispatchReport {
        let snapshot = self.table.load_full();
        let mut report = DispatchReport::default();
        let Some(hooks) = snapshot.by_event.get(event) else {
            return report;
        };

        for entry in hooks {
            let name = entry.hook.name().to_string();
            let outcome = AssertUnwindSafe(entry.hook.call(event, args))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::internal(format!("hook {name} panicked"))));

            if let Err(error) = outcome {
                tracing::warn!(
                    event = %entry.event,
                    hook = %name,
                    hook_id = %entry.id,
                    error = %error,
                    "hook_failed"
                );
                report.failures.push(HookFailure {
                    hook_id: entry.id.clone(),
                    hook: name.clone(),
                    error,
                });
            }
            report.ran.push(name);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn recording(name: &str, log: Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn Hook> {
        let label = name.to_string();
        Arc::new(FnHook::new(name, move |_event, _args| {
            let log = Arc::clone(&log);
            let label = label.clone();
            async move {
                log.lock().unwrap().push(label.clone());
                if fail {
                    Err(Error::internal(format!("{label} broke")))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }))
    }

    #[tokio::test]
    async fn test_priority_order_and_failure_isolation() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register_hook("message.inbound", 10, recording("ten", log.clone(), false));
        registry.register_hook("message.inbound", 5, recording("five", log.clone(), false));
        let failing = registry.register_hook("message.inbound", 20, recording("twenty", log.clone(), true));

        let report = registry.dispatch("message.inbound", &serde_json::json!({})).await;

        assert_eq!(*log.lock().unwrap(), vec!["twenty", "ten", "five"]);
        assert_eq!(report.handlers_run(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].hook_id, failing);
        assert_eq!(report.failures[0].hook, "twenty");
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            registry.register_hook("skill.completed", 0, recording(name, log.clone(), false));
        }
        registry.register_hook("skill.completed", 1, recording("first", log.clone(), false));

        assert_eq!(registry.hooks_for("skill.completed"), vec!["first", "a", "b", "c"]);
    }

    #[derive(Debug)]
    struct Panicker;

    #[async_trait]
    impl Hook for Panicker {
        fn name(&self) -> &str {
            "boom"
        }

        async fn call(&self, _event: &str, _args: &serde_json::Value) -> Result<()> {
            panic!("hook bug")
        }
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register_hook("skill.failed", 10, Arc::new(Panicker));
        registry.register_hook("skill.failed", 0, recording("after", log.clone(), false));

        let report = registry.dispatch("skill.failed", &serde_json::Value::Null).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_unregister_and_unknown_event() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry.register_hook("config.reloaded", 0, recording("x", log.clone(), false));

        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert_eq!(registry.hook_count(), 0);

        let report = registry.dispatch("config.reloaded", &serde_json::Value::Null).await;
        assert!(report.is_clean());
        assert_eq!(report.handlers_run(), 0);
    }

    #[test]
    fn test_plugin_registration() {
        let registry = HookRegistry::new();
        let info = PluginInfo {
            name: "audit".into(),
            version: "0.1.0".into(),
            description: "writes an audit trail".into(),
            inputs: vec!["message".into()],
        };
        registry.register_plugin(info.clone()).unwrap();
        assert_eq!(
            registry.register_plugin(info.clone()).unwrap_err().code(),
            "DUPLICATE_NAME"
        );
        assert_eq!(registry.plugin("audit"), Some(info));
        assert_eq!(registry.plugins().len(), 1);
    }
}
