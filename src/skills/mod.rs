//! Skills - named units of work the daemon dispatches to.
//!
//! A skill either runs in-process ([`Skill::execute`]) or, when its
//! descriptor carries a [`SandboxSpec`], renders a command that the active
//! [`SandboxBackend`] runs under that spec.

mod registry;
pub mod sandbox;

pub use registry::{SkillRegistry, INVOKE_ACTION};
pub use sandbox::{
    select_backend, BackendPreference, HostProcessBackend, NetworkPolicy, NoopBackend,
    SandboxBackend, SandboxOutput, SandboxSpec,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::session::Capability;
use crate::types::{Error, Identity, InvocationId, Result};

/// Per-invocation state. Never shared between invocations.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub invocation_id: InvocationId,
    pub identity: Identity,
    pub skill: String,
    pub started_at: DateTime<Utc>,
    /// Cancelled when the invoking session closes or the daemon stops.
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub(crate) fn for_capability(capability: &Capability, skill: &str) -> Self {
        Self {
            invocation_id: InvocationId::new(),
            identity: capability.identity().clone(),
            skill: skill.to_string(),
            started_at: Utc::now(),
            cancel: capability.cancellation().clone(),
        }
    }
}

#[async_trait]
pub trait Skill: Send + Sync + fmt::Debug {
    /// Run in-process.
    async fn execute(&self, input: &str, ctx: &InvocationContext) -> Result<String>;

    /// Command line for a sandboxed run.
    fn render_command(&self, _input: &str) -> Result<String> {
        Err(Error::validation("skill has no sandboxed form"))
    }

    /// Skills that can only run inside a sandbox.
    fn requires_sandbox(&self) -> bool {
        false
    }
}

/// Registry entry.
#[derive(Debug, Clone)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub skill: Arc<dyn Skill>,
    /// Run under this spec instead of in-process.
    pub sandbox: Option<SandboxSpec>,
}

impl SkillDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, skill: Arc<dyn Skill>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            skill,
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, spec: SandboxSpec) -> Self {
        self.sandbox = Some(spec);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "skill name {:?} must be non-empty and contain no whitespace",
                self.name
            )));
        }
        if let Some(spec) = &self.sandbox {
            spec.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Adapters
// =============================================================================

type SkillFn = dyn Fn(String, InvocationContext) -> BoxFuture<'static, Result<String>> + Send + Sync;

/// In-process skill backed by a closure.
#[derive(Clone)]
pub struct FnSkill {
    f: Arc<SkillFn>,
}

impl FnSkill {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(String, InvocationContext) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

impl fmt::Debug for FnSkill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSkill").finish_non_exhaustive()
    }
}

#[async_trait]
impl Skill for FnSkill {
    async fn execute(&self, input: &str, ctx: &InvocationContext) -> Result<String> {
        (self.f)(input.to_string(), ctx.clone()).await
    }
}

/// Sandbox-only skill that renders a shell command from a template.
///
/// `{input}` in the template is replaced by the single-quoted input.
#[derive(Debug, Clone)]
pub struct CommandSkill {
    template: String,
}

impl CommandSkill {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
impl Skill for CommandSkill {
    async fn execute(&self, _input: &str, _ctx: &InvocationContext) -> Result<String> {
        Err(Error::validation("command skills only run sandboxed"))
    }

    fn render_command(&self, input: &str) -> Result<String> {
        Ok(self.template.replace("{input}", &shell_quote(input)))
    }

    fn requires_sandbox(&self) -> bool {
        true
    }
}
