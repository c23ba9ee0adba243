//! Skill registry and invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

use super::{InvocationContext, SandboxBackend, SandboxSpec, SkillDescriptor};
use crate::session::Capability;
use crate::types::{Error, Result, SandboxError};

/// Action a capability must grant to invoke a skill.
pub const INVOKE_ACTION: &str = "invoke";

/// Name → skill table plus the sandbox backend sandboxed skills run on.
///
/// Registration is rare and takes the write lock; lookups and invocations
/// share the read lock only long enough to clone the descriptor.
#[derive(Debug)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Arc<SkillDescriptor>>>,
    backend: Arc<dyn SandboxBackend>,
    sandbox_slots: Arc<Semaphore>,
    default_spec: SandboxSpec,
    shutdown_grace: Duration,
}

impl SkillRegistry {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        max_concurrent: usize,
        default_spec: SandboxSpec,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
            backend,
            sandbox_slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            default_spec,
            shutdown_grace,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Add a skill. Fails with `DuplicateName` if the name is taken; the
    /// existing entry is left as it was.
    ///
    /// Sandbox-only skills registered without a spec get the default one.
    pub async fn register(&self, mut descriptor: SkillDescriptor) -> Result<()> {
        if descriptor.sandbox.is_none() && descriptor.skill.requires_sandbox() {
            descriptor.sandbox = Some(self.default_spec.clone());
        }
        descriptor.validate()?;

        let mut skills = self.skills.write().await;
        if skills.contains_key(&descriptor.name) {
            return Err(Error::duplicate_name(format!(
                "skill {} already registered",
                descriptor.name
            )));
        }

        tracing::info!(
            skill = %descriptor.name,
            sandboxed = descriptor.sandbox.is_some(),
            "skill_registered"
        );
        skills.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<Arc<SkillDescriptor>> {
        let removed = self.skills.write().await.remove(name);
        match removed {
            Some(d) => {
                tracing::info!(skill = name, "skill_unregistered");
                Ok(d)
            }
            None => Err(Error::not_found(format!("skill {name}"))),
        }
    }

    pub async fn lookup(&self, name: &str) -> Result<Arc<SkillDescriptor>> {
        self.skills
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("skill {name}")))
    }

    /// Registered names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.skills.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.skills.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.skills.read().await.is_empty()
    }

    /// Run skill `name` on `input`.
    ///
    /// `capability` must grant `("invoke", name)`. If the capability's
    /// session closes (or the daemon shuts down) mid-run, the invocation gets
    /// the shutdown grace period to finish, is then dropped, and the result
    /// is `Cancelled` either way.
    pub async fn invoke(&self, capability: &Capability, name: &str, input: &str) -> Result<String> {
        if !capability.permits(INVOKE_ACTION, name) {
            return Err(Error::not_authorized(format!(
                "capability for {} {} does not cover invoke {name}",
                capability.action(),
                capability.resource()
            )));
        }

        let descriptor = self.lookup(name).await?;
        let ctx = InvocationContext::for_capability(capability, name);
        if ctx.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("session for {} closed", ctx.identity)));
        }

        tracing::debug!(
            skill = name,
            invocation_id = %ctx.invocation_id,
            identity = %ctx.identity,
            "skill_invoking"
        );

        let cancel = ctx.cancel.clone();
        let run = self.run(&descriptor, input, &ctx);
        tokio::pin!(run);

        tokio::select! {
            biased;
            result = &mut run => {
                if let Err(e) = &result {
                    tracing::debug!(skill = name, invocation_id = %ctx.invocation_id, error = %e, "skill_failed");
                }
                result
            }
            _ = cancel.cancelled() => {
                if tokio::time::timeout(self.shutdown_grace, &mut run).await.is_err() {
                    tracing::warn!(
                        skill = name,
                        invocation_id = %ctx.invocation_id,
                        grace = ?self.shutdown_grace,
                        "skill_dropped_after_grace"
                    );
                }
                Err(Error::cancelled(format!(
                    "invocation {} of {name} cancelled",
                    ctx.invocation_id
                )))
            }
        }
    }

    async fn run(&self, descriptor: &SkillDescriptor, input: &str, ctx: &InvocationContext) -> Result<String> {
        let Some(spec) = &descriptor.sandbox else {
            return descriptor.skill.execute(input, ctx).await;
        };

        let command = descriptor.skill.render_command(input)?;
        let _slot = self
            .sandbox_slots
            .acquire()
            .await
            .map_err(|_| Error::cancelled("sandbox slots closed"))?;

        let output = self.backend.execute(spec, &command).await?;
        if !output.success() {
            return Err(Error::Sandbox(SandboxError::Execution(format!(
                "exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ))));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Effect, Policy};
    use crate::session::{AllowAllIdentityProvider, Authorized, Credential, Session};
    use crate::skills::{CommandSkill, FnSkill, NoopBackend};
    use crate::types::Identity;
    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    fn echo() -> SkillDescriptor {
        SkillDescriptor::new(
            "echo",
            "returns its input",
            Arc::new(FnSkill::new(|input, _| async move { Ok(input) }.boxed())),
        )
    }

    fn registry(backend: Arc<dyn SandboxBackend>) -> SkillRegistry {
        SkillRegistry::new(backend, 2, SandboxSpec::default(), Duration::from_millis(50))
    }

    async fn authorized(root: &CancellationToken) -> Session<Authorized> {
        let alice = Identity::new("alice").unwrap();
        let policy = Policy::new(Vec::new(), Effect::Allow);
        Session::new(alice.clone(), root)
            .authenticate(&AllowAllIdentityProvider::default(), &Credential::channel(alice))
            .await
            .unwrap()
            .authorize(&policy, INVOKE_ACTION, "echo")
            .unwrap()
    }

    async fn capability(session: &mut Session<Authorized>, skill: &str) -> Capability {
        session
            .permit(&Policy::new(Vec::new(), Effect::Allow), INVOKE_ACTION, skill)
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_and_original_kept() {
        let registry = registry(Arc::new(NoopBackend::new()));
        registry.register(echo()).await.unwrap();

        let imposter = SkillDescriptor::new(
            "echo",
            "imposter",
            Arc::new(FnSkill::new(|_, _| async { Ok("pwned".to_string()) }.boxed())),
        );
        let err = registry.register(imposter).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_NAME");

        let root = CancellationToken::new();
        let mut session = authorized(&root).await;
        let cap = capability(&mut session, "echo").await;
        assert_eq!(registry.invoke(&cap, "echo", "hi").await.unwrap(), "hi");
        assert_eq!(registry.lookup("echo").await.unwrap().description, "returns its input");
    }

    #[tokio::test]
    async fn test_lookup_missing_is_not_found() {
        let registry = registry(Arc::new(NoopBackend::new()));
        assert_eq!(registry.lookup("nope").await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(registry.unregister("nope").await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_capability_must_cover_skill() {
        let registry = registry(Arc::new(NoopBackend::new()));
        registry.register(echo()).await.unwrap();

        let root = CancellationToken::new();
        let mut session = authorized(&root).await;
        let cap = capability(&mut session, "time").await;

        let err = registry.invoke(&cap, "echo", "hi").await.unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
    }

    #[tokio::test]
    async fn test_sandboxed_skill_runs_on_backend() {
        let backend = Arc::new(NoopBackend::new().with_output("sandboxed"));
        let registry = registry(backend.clone());
        registry
            .register(SkillDescriptor::new("ls", "list", Arc::new(CommandSkill::new("ls {input}"))))
            .await
            .unwrap();

        // Sandbox-only skills pick up the default spec.
        assert!(registry.lookup("ls").await.unwrap().sandbox.is_some());

        let root = CancellationToken::new();
        let mut session = authorized(&root).await;
        let cap = capability(&mut session, "ls").await;
        assert_eq!(registry.invoke(&cap, "ls", "/tmp").await.unwrap(), "sandboxed");
        assert_eq!(backend.executed(), vec!["ls '/tmp'"]);
    }

    #[tokio::test]
    async fn test_sandbox_errors_propagate_typed() {
        let registry = registry(Arc::new(NoopBackend::new().timing_out()));
        registry
            .register(SkillDescriptor::new("slow", "", Arc::new(CommandSkill::new("sleep 60"))))
            .await
            .unwrap();

        let root = CancellationToken::new();
        let mut session = authorized(&root).await;
        let cap = capability(&mut session, "slow").await;
        let err = registry.invoke(&cap, "slow", "").await.unwrap_err();
        assert_eq!(err.code(), "SANDBOX_TIMEOUT");
    }

    #[tokio::test]
    async fn test_session_close_cancels_in_flight_invocation() {
        let registry = Arc::new(registry(Arc::new(NoopBackend::new())));
        registry
            .register(SkillDescriptor::new(
                "hang",
                "never finishes",
                Arc::new(FnSkill::new(|_, _| {
                    async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(String::new())
                    }
                    .boxed()
                })),
            ))
            .await
            .unwrap();

        let root = CancellationToken::new();
        let mut session = authorized(&root).await;
        let cap = capability(&mut session, "hang").await;

        let task = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke(&cap, "hang", "").await })
        };
        tokio::task::yield_now().await;
        session.close();

        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let registry = registry(Arc::new(NoopBackend::new()));
        for name in ["zeta", "alpha", "mid"] {
            let mut d = echo();
            d.name = name.to_string();
            registry.register(d).await.unwrap();
        }
        assert_eq!(registry.list().await, vec!["alpha", "mid", "zeta"]);
        registry.unregister("mid").await.unwrap();
        assert_eq!(registry.len().await, 2);
    }
}
