//! Per-identity session table.
//!
//! Holds each sender's typestate [`Session`] as a [`SessionPhase`] and
//! drives it forward on demand. Entries are created on first contact and
//! removed on logout or idle eviction. Operations on one identity are
//! serialized by that entry's lock; different identities never contend.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::policy::Policy;
use crate::session::{
    Authenticated, Authorized, Capability, ClosedSession, Credential, IdentityProvider, Principal,
    Session, Unauthenticated,
};
use crate::types::{Error, Identity, Result};

/// Runtime view of a session's typestate.
#[derive(Debug)]
pub enum SessionPhase {
    Unauthenticated(Session<Unauthenticated>),
    Authenticated(Session<Authenticated>),
    Authorized(Session<Authorized>),
    Closed(ClosedSession),
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Unauthenticated(s) => s.phase_name(),
            SessionPhase::Authenticated(s) => s.phase_name(),
            SessionPhase::Authorized(s) => s.phase_name(),
            SessionPhase::Closed(_) => "closed",
        }
    }

    /// The principal an Authenticated or Authorized session acts as.
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            SessionPhase::Authenticated(s) => Some(s.principal()),
            SessionPhase::Authorized(s) => Some(s.principal()),
            _ => None,
        }
    }

    fn close(self) -> ClosedSession {
        match self {
            SessionPhase::Unauthenticated(s) => s.close(),
            SessionPhase::Authenticated(s) => s.close(),
            SessionPhase::Authorized(s) => s.close(),
            SessionPhase::Closed(c) => c,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    phase: SessionPhase,
    last_active: Instant,
}

impl SessionEntry {
    fn fresh(identity: Identity, root: &CancellationToken) -> Self {
        Self {
            phase: SessionPhase::Unauthenticated(Session::new(identity, root)),
            last_active: Instant::now(),
        }
    }

    /// Move the phase out, leaving a closed placeholder.
    fn take(&mut self, identity: &Identity) -> SessionPhase {
        let placeholder = ClosedSession::detached(identity.clone());
        std::mem::replace(&mut self.phase, SessionPhase::Closed(placeholder))
    }
}

/// Identity → session.
#[derive(Debug)]
pub struct SessionTable {
    sessions: DashMap<Identity, Arc<Mutex<SessionEntry>>>,
    root: CancellationToken,
}

impl SessionTable {
    /// Session tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            sessions: DashMap::new(),
            root,
        }
    }

    fn entry(&self, identity: &Identity) -> Arc<Mutex<SessionEntry>> {
        self.sessions
            .entry(identity.clone())
            .or_insert_with(|| {
                tracing::debug!(identity = %identity, "session_created");
                Arc::new(Mutex::new(SessionEntry::fresh(identity.clone(), &self.root)))
            })
            .clone()
    }

    /// Create the session if this is first contact. Returns its phase name.
    pub async fn touch(&self, identity: &Identity) -> &'static str {
        let entry = self.entry(identity);
        let mut entry = entry.lock().await;
        entry.last_active = Instant::now();
        entry.phase.name()
    }

    /// Authenticate `credential.identity`'s session if it is not already.
    ///
    /// A failed attempt leaves the session Unauthenticated.
    pub async fn authenticate(
        &self,
        provider: &dyn IdentityProvider,
        credential: &Credential,
    ) -> Result<()> {
        let identity = &credential.identity;
        let entry = self.entry(identity);
        let mut entry = entry.lock().await;
        entry.last_active = Instant::now();

        let session = match entry.take(identity) {
            SessionPhase::Unauthenticated(s) => s,
            // A closed placeholder means an earlier transition was interrupted.
            SessionPhase::Closed(_) => Session::new(identity.clone(), &self.root),
            already => {
                entry.phase = already;
                return Ok(());
            }
        };

        match session.authenticate(provider, credential).await {
            Ok(s) => {
                entry.phase = SessionPhase::Authenticated(s);
                Ok(())
            }
            Err(rejected) => {
                let (s, error) = rejected.into_parts();
                entry.phase = SessionPhase::Unauthenticated(s);
                Err(error)
            }
        }
    }

    /// Get a capability for `action` on `resource`.
    ///
    /// Authenticated sessions are authorized first; Authorized ones are
    /// checked against the current snapshot. An Unauthenticated session
    /// fails with `NotAuthorized`.
    pub async fn authorize(
        &self,
        identity: &Identity,
        policy: &Policy,
        action: &str,
        resource: &str,
    ) -> Result<Capability> {
        let entry = self.entry(identity);
        let mut entry = entry.lock().await;
        entry.last_active = Instant::now();

        let (phase, result) = match entry.take(identity) {
            SessionPhase::Authenticated(s) => match s.authorize(policy, action, resource) {
                Ok(mut s) => {
                    let cap = s.permit(policy, action, resource);
                    (SessionPhase::Authorized(s), cap)
                }
                Err(rejected) => {
                    let (s, error) = rejected.into_parts();
                    (SessionPhase::Authenticated(s), Err(error))
                }
            },
            SessionPhase::Authorized(mut s) => {
                let cap = s.permit(policy, action, resource);
                (SessionPhase::Authorized(s), cap)
            }
            other => {
                let error = Error::not_authorized(format!(
                    "session for {identity} is {}, not authenticated",
                    other.name()
                ));
                (other, Err(error))
            }
        };

        entry.phase = phase;
        result
    }

    /// Logout or disconnect. Cancels the session's in-flight work.
    pub async fn close(&self, identity: &Identity) -> Option<ClosedSession> {
        let (_, entry) = self.sessions.remove(identity)?;
        let mut entry = entry.lock().await;
        let closed = entry.take(identity).close();
        tracing::info!(identity = %identity, from = closed.from_phase(), "session_logged_out");
        Some(closed)
    }

    pub async fn phase(&self, identity: &Identity) -> Option<&'static str> {
        let entry = self.sessions.get(identity).map(|e| Arc::clone(e.value()))?;
        let entry = entry.lock().await;
        Some(entry.phase.name())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close and drop sessions idle for at least `idle`.
    ///
    /// Sessions busy in a transition are skipped this round.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.evict_idle_at(idle, Instant::now())
    }

    pub fn evict_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|identity, entry| {
            let Ok(mut guard) = entry.try_lock() else {
                return true;
            };
            if now.saturating_duration_since(guard.last_active) < idle {
                return true;
            }
            let closed = guard.take(identity).close();
            tracing::debug!(identity = %identity, from = closed.from_phase(), "session_evicted_idle");
            evicted += 1;
            false
        });
        evicted
    }

    /// Re-resolve every signed-in principal against `provider` and close the
    /// sessions whose identity is now rejected or whose roles changed.
    ///
    /// Closing cancels their in-flight invocations; the next message starts
    /// a fresh session under the current table.
    pub async fn revalidate(&self, provider: &dyn IdentityProvider) -> usize {
        let identities: Vec<Identity> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut revoked = 0;
        for identity in identities {
            let Some(entry) = self.sessions.get(&identity).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let stale = {
                let entry = entry.lock().await;
                let Some(principal) = entry.phase.principal() else {
                    continue;
                };
                match provider.authenticate(&Credential::channel(identity.clone())).await {
                    Ok(fresh) => fresh != *principal,
                    Err(_) => true,
                }
            };
            if stale && self.close(&identity).await.is_some() {
                tracing::info!(identity = %identity, "session_revoked_on_reload");
                revoked += 1;
            }
        }
        revoked
    }

    /// Close every session.
    pub async fn close_all(&self) -> usize {
        let identities: Vec<Identity> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for identity in identities {
            if self.close(&identity).await.is_some() {
                closed += 1;
            }
        }
        closed
    }
}
