//! Kernel - the daemon core.
//!
//! The Kernel owns every subsystem and drives each inbound message through
//! the same pipeline:
//!
//! ```text
//! channel → rate limit → session (authenticate / authorize) → bus (inbound)
//!         → hooks → skill → bus (outbound) → hooks → channel
//! ```
//!
//! Subsystems (sessions, rate limiter, skills, hooks) are plain structs owned
//! by the Kernel, not separate actors. Shared snapshots (config, policy,
//! hooks) are swapped atomically so a reload never blocks a request.

pub mod cleanup;
pub mod dispatch;
pub mod rate_limiter;
pub mod sessions;

pub use cleanup::{CleanupService, CleanupStats};
pub use dispatch::SkillRequest;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use sessions::{SessionPhase, SessionTable};

use arc_swap::ArcSwap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channel::{state::Verified, Channel, InboundMessage};
use crate::commbus::EventBus;
use crate::envelope::{Direction, Envelope};
use crate::hooks::{events, HookRegistry};
use crate::policy::{Policy, PolicyStore};
use crate::session::{Credential, IdentityProvider, StaticIdentityProvider};
use crate::skills::{select_backend, SandboxBackend, SkillRegistry, INVOKE_ACTION};
use crate::types::{Config, Error, Identity, Result};

/// Extra drain time on shutdown beyond `runtime.shutdown_grace`.
const REPLY_MARGIN: Duration = Duration::from_secs(1);

/// Daemon core.
#[derive(Debug)]
pub struct Kernel {
    config: ArcSwap<Config>,
    bus: EventBus,
    policy: PolicyStore,
    sessions: SessionTable,
    rate_limiter: RateLimiter,
    skills: SkillRegistry,
    hooks: HookRegistry,
    identity: Arc<dyn IdentityProvider>,
    shutdown: CancellationToken,
}

impl Kernel {
    /// Build a kernel from a validated configuration snapshot.
    ///
    /// Fails with `ConfigInvalid` if the snapshot is invalid or the event
    /// bus cannot be constructed.
    pub fn new(
        config: Config,
        identity: Arc<dyn IdentityProvider>,
        backend: Arc<dyn SandboxBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new(config.bus.capacity)?;
        let shutdown = CancellationToken::new();

        let policy = PolicyStore::new(Policy::new(
            config.policy.rules.clone(),
            config.policy.default_effect,
        ));
        let skills = SkillRegistry::new(
            backend,
            config.sandbox.max_concurrent,
            config.sandbox.defaults.clone(),
            config.runtime.shutdown_grace,
        );

        tracing::info!(
            rules = config.policy.rules.len(),
            bus_capacity = config.bus.capacity,
            identity_provider = identity.name(),
            sandbox_backend = skills.backend().name(),
            "kernel_created"
        );

        Ok(Self {
            sessions: SessionTable::new(shutdown.clone()),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            hooks: HookRegistry::new(),
            config: ArcSwap::new(Arc::new(config)),
            bus,
            policy,
            skills,
            identity,
            shutdown,
        })
    }

    /// Kernel with the static identity table and sandbox backend the
    /// configuration names.
    pub fn from_config(config: Config) -> Result<Self> {
        let identity = Arc::new(StaticIdentityProvider::from_config(&config.identity));
        let backend = select_backend(config.sandbox.backend)?;
        Self::new(config, identity, backend)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn skills(&self) -> &SkillRegistry {
        &self.skills
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // =========================================================================
    // Request pipeline
    // =========================================================================

    /// Run one inbound message through the full pipeline.
    ///
    /// Returns the outbound reply, which has also been published.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<Envelope> {
        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled("daemon shutting down"));
        }
        let InboundMessage { sender, text } = message;

        self.rate_limiter.check(sender.as_str())?;
        let request = SkillRequest::parse(&text)?;

        self.sessions
            .authenticate(self.identity.as_ref(), &Credential::channel(sender.clone()))
            .await?;
        let policy = self.policy.load();
        let capability = self
            .sessions
            .authorize(&sender, &policy, INVOKE_ACTION, &request.skill)
            .await?;

        let inbound = Envelope::inbound(sender.clone(), text);
        self.bus.publish(inbound.clone());
        self.hooks
            .dispatch(
                events::MESSAGE_INBOUND,
                &json!({
                    "sender": sender.as_str(),
                    "skill": request.skill,
                    "envelope_id": inbound.id().as_str(),
                }),
            )
            .await;

        match self
            .skills
            .invoke(&capability, &request.skill, &request.input)
            .await
        {
            Ok(output) => {
                let reply = inbound.reply(output);
                self.bus.publish(reply.clone());
                self.hooks
                    .dispatch(
                        events::SKILL_COMPLETED,
                        &json!({
                            "sender": sender.as_str(),
                            "skill": request.skill,
                            "envelope_id": reply.id().as_str(),
                        }),
                    )
                    .await;
                Ok(reply)
            }
            Err(error) => {
                tracing::info!(
                    sender = %sender,
                    skill = %request.skill,
                    code = error.code(),
                    error = %error,
                    "skill_failed"
                );
                self.hooks
                    .dispatch(
                        events::SKILL_FAILED,
                        &json!({
                            "sender": sender.as_str(),
                            "skill": request.skill,
                            "error": error.code(),
                            "message": error.to_string(),
                        }),
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Handle a message and publish an error reply if it is refused.
    async fn process(&self, message: InboundMessage) {
        let sender = message.sender.clone();
        if let Err(error) = self.handle_inbound(message).await {
            tracing::debug!(sender = %sender, code = error.code(), "inbound_rejected");
            self.bus.publish(dispatch::error_reply(sender, &error));
        }
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Serve `channel` until it closes or [`shutdown`](Self::shutdown) is
    /// called.
    ///
    /// Messages are handled concurrently. Outbound bus traffic is forwarded
    /// to the channel. On channel close in-flight work finishes normally; on
    /// shutdown it gets the configured grace period and is then dropped.
    pub async fn run(self: Arc<Self>, channel: Channel<Verified>) -> Result<()> {
        tracing::info!(channel = channel.name(), account = channel.account(), "kernel_running");

        let egress_stop = CancellationToken::new();
        let egress = tokio::spawn(dispatch::forward_outbound(
            channel.adapter(),
            self.bus.subscribe_direction(Direction::Outbound),
            egress_stop.clone(),
        ));
        let mut cleanup = CleanupService::new(Arc::clone(&self));
        let cleanup_handle = cleanup.start();

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = channel.recv() => match message {
                    Some(message) => {
                        let kernel = Arc::clone(&self);
                        tasks.spawn(async move { kernel.process(message).await });
                    }
                    None => {
                        tracing::info!(channel = channel.name(), "channel_closed");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "inbound_task_failed");
                    }
                }
            }
        }

        self.drain(&mut tasks).await;

        cleanup.stop();
        if let Err(e) = cleanup_handle.await {
            tracing::error!(error = %e, "cleanup_task_failed");
        }
        egress_stop.cancel();
        if let Err(e) = egress.await {
            tracing::error!(error = %e, "egress_task_failed");
        }

        tracing::info!("kernel_stopped");
        Ok(())
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        // Let in-flight work finish unless shutdown arrives first.
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        return;
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Skills are already bounded by the grace period; the margin lets
        // their Cancelled replies reach the bus before anything is aborted.
        let grace = self.config().runtime.shutdown_grace + REPLY_MARGIN;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), ?grace, "inbound_tasks_aborted");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Swap in a new configuration.
    ///
    /// An invalid snapshot is logged and rejected; the previous one stays
    /// active. Sessions whose principal no longer resolves to the same roles
    /// are closed. Bus capacity, sandbox backend and sandbox concurrency are
    /// fixed at startup.
    pub async fn reload(&self, config: Config) -> Result<()> {
        if let Err(error) = config.validate() {
            tracing::error!(error = %error, "config_reload_rejected");
            return Err(error);
        }

        let previous = self.config();
        if previous.bus.capacity != config.bus.capacity
            || previous.sandbox.backend != config.sandbox.backend
            || previous.sandbox.max_concurrent != config.sandbox.max_concurrent
        {
            tracing::warn!("config_reload_ignores_bus_and_sandbox_changes_until_restart");
        }

        self.policy.replace(Policy::new(
            config.policy.rules.clone(),
            config.policy.default_effect,
        ));
        self.rate_limiter.update_config(config.rate_limit.clone());
        self.identity.reload(&config.identity);
        let revoked = self.sessions.revalidate(self.identity.as_ref()).await;

        let rules = config.policy.rules.len();
        self.config.store(Arc::new(config));
        tracing::info!(rules, revoked, "config_reloaded");

        self.hooks
            .dispatch(events::CONFIG_RELOADED, &json!({ "rules": rules }))
            .await;
        Ok(())
    }

    /// Close `identity`'s session, cancelling its in-flight invocations.
    pub async fn logout(&self, identity: &Identity) -> bool {
        self.sessions.close(identity).await.is_some()
    }

    /// Stop the main loop and cancel every session.
    pub fn shutdown(&self) {
        tracing::info!("kernel_shutdown_requested");
        self.shutdown.cancel();
    }
}
