//! Configuration structures.
//!
//! The core consumes an already-parsed snapshot; loading from disk is the
//! caller's job. `Config::validate` is the single gate every snapshot passes
//! before it becomes active.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::kernel::rate_limiter::RateLimitConfig;
use crate::policy::{Effect, PolicyRule};
use crate::skills::sandbox::{BackendPreference, SandboxSpec};
use crate::types::{Error, Result};

/// Default event bus capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Global daemon configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Access-control rules and the default for unmatched requests.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Per-sender admission control.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Sandbox backend selection and default ceilings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Session lifecycle.
    #[serde(default)]
    pub session: SessionConfig,

    /// Identity → role mapping.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Event bus sizing.
    #[serde(default)]
    pub bus: BusConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Background task and shutdown timing.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Policy section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Effect applied when no rule matches.
    pub default_effect: Effect,

    /// Rules in configuration order.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_effect: Effect::Deny,
            rules: Vec::new(),
        }
    }
}

/// Sandbox section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Which backend to run sandboxed skills on.
    pub backend: BackendPreference,

    /// Maximum sandboxed invocations in flight at once.
    pub max_concurrent: usize,

    /// Ceilings for sandbox-only skills registered without an explicit spec.
    pub defaults: SandboxSpec,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            max_concurrent: 4,
            defaults: SandboxSpec::default(),
        }
    }
}

/// Session section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are closed by the cleanup cycle.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Identity section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// identity → roles.
    #[serde(default)]
    pub role_map: HashMap<String, Vec<String>>,

    /// Role given to identities missing from `role_map`. `None` rejects them.
    #[serde(default)]
    pub default_role: Option<String>,
}

/// Bus section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Ring buffer capacity shared by all subscribers.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// Most-recent-N log records retained for dashboard readers.
    pub log_ring_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            log_ring_capacity: 1000,
        }
    }
}

/// Runtime timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How often idle sessions and rate buckets are swept.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// How long in-flight work may take to unwind after cancellation.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Check the snapshot for values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bus.capacity == 0 {
            return Err(Error::config_invalid("bus.capacity must be at least 1"));
        }
        if self.rate_limit.max_tokens == 0 {
            return Err(Error::config_invalid(
                "rate_limit.max_tokens must be at least 1",
            ));
        }
        if self.rate_limit.refill_interval.is_zero() {
            return Err(Error::config_invalid(
                "rate_limit.refill_interval must be non-zero",
            ));
        }
        if self.sandbox.max_concurrent == 0 {
            return Err(Error::config_invalid(
                "sandbox.max_concurrent must be at least 1",
            ));
        }
        self.sandbox
            .defaults
            .validate()
            .map_err(|e| Error::config_invalid(format!("sandbox.defaults: {e}")))?;
        if self.session.idle_timeout.is_zero() {
            return Err(Error::config_invalid(
                "session.idle_timeout must be non-zero",
            ));
        }
        if self.runtime.cleanup_interval.is_zero() {
            return Err(Error::config_invalid(
                "runtime.cleanup_interval must be non-zero",
            ));
        }
        if self.observability.log_ring_capacity == 0 {
            return Err(Error::config_invalid(
                "observability.log_ring_capacity must be at least 1",
            ));
        }
        for (i, rule) in self.policy.rules.iter().enumerate() {
            rule.validate()
                .map_err(|reason| Error::config_invalid(format!("policy.rules[{i}]: {reason}")))?;
        }
        if let Some(role) = &self.identity.default_role {
            if role.is_empty() {
                return Err(Error::config_invalid(
                    "identity.default_role must not be empty",
                ));
            }
        }
        Ok(())
    }
}
