//! Typestate session lifecycle.
//!
//! `Session<S>` moves `Unauthenticated → Authenticated → Authorized`, each
//! transition consuming the previous value. Only `Session<Authorized>` can
//! mint a [`Capability`], and privileged operations take `&Capability`, so
//! skipping a phase does not type-check. A failed transition hands the
//! unchanged session back inside [`Rejected`].
//!
//! Every session owns a cancellation token, a child of the daemon's root
//! token. Closing the session cancels it, which aborts any invocation that
//! was started with one of its capabilities.

mod identity;

pub use identity::{
    AllowAllIdentityProvider, Credential, IdentityProvider, Principal, StaticIdentityProvider,
};

use chrono::{DateTime, Utc};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::policy::{Effect, Policy};
use crate::types::{Error, Identity, Result};

mod sealed {
    pub trait Sealed {}
}

/// Session phase marker.
pub trait Phase: sealed::Sealed + fmt::Debug + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Fresh contact; nothing verified yet.
#[derive(Debug)]
pub struct Unauthenticated;

/// Identity verified; roles known.
#[derive(Debug)]
pub struct Authenticated {
    principal: Principal,
}

/// Policy has admitted the principal at least once.
#[derive(Debug)]
pub struct Authorized {
    principal: Principal,
    grants: Vec<Grant>,
}

impl sealed::Sealed for Unauthenticated {}
impl sealed::Sealed for Authenticated {}
impl sealed::Sealed for Authorized {}

impl Phase for Unauthenticated {
    const NAME: &'static str = "unauthenticated";
}
impl Phase for Authenticated {
    const NAME: &'static str = "authenticated";
}
impl Phase for Authorized {
    const NAME: &'static str = "authorized";
}

/// An `(action, resource)` pair policy has allowed for this session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grant {
    pub action: String,
    pub resource: String,
}

/// One principal's progress through the access lifecycle.
#[derive(Debug)]
pub struct Session<S: Phase> {
    identity: Identity,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: S,
}

/// A refused transition: the error plus the session as it was.
pub struct Rejected<S: Phase> {
    pub session: Session<S>,
    pub error: Error,
}

impl<S: Phase> Rejected<S> {
    pub fn into_parts(self) -> (Session<S>, Error) {
        (self.session, self.error)
    }

    pub fn into_error(self) -> Error {
        self.error
    }
}

impl<S: Phase> fmt::Debug for Rejected<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("identity", &self.session.identity)
            .field("phase", &S::NAME)
            .field("error", &self.error)
            .finish()
    }
}

impl<S: Phase> From<Rejected<S>> for Error {
    fn from(rejected: Rejected<S>) -> Self {
        rejected.error
    }
}

/// Terminal state. Holds only what is useful for logging.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    identity: Identity,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
    from_phase: &'static str,
}

impl ClosedSession {
    /// Stand-in for a session whose state was moved out mid-transition.
    pub(crate) fn detached(identity: Identity) -> Self {
        let now = Utc::now();
        Self {
            identity,
            opened_at: now,
            closed_at: now,
            from_phase: "closed",
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn closed_at(&self) -> DateTime<Utc> {
        self.closed_at
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Phase the session was in when it closed.
    pub fn from_phase(&self) -> &'static str {
        self.from_phase
    }
}

impl<S: Phase> Session<S> {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn phase_name(&self) -> &'static str {
        S::NAME
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Token cancelled when this session closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// End the session from any phase, cancelling its in-flight work.
    pub fn close(self) -> ClosedSession {
        self.cancel.cancel();
        tracing::debug!(identity = %self.identity, phase = S::NAME, "session_closed");
        ClosedSession {
            identity: self.identity,
            opened_at: self.created_at,
            closed_at: Utc::now(),
            from_phase: S::NAME,
        }
    }

    fn advance<T: Phase>(self, state: T) -> Session<T> {
        Session {
            identity: self.identity,
            created_at: self.created_at,
            cancel: self.cancel,
            state,
        }
    }

    fn reject(self, error: Error) -> Rejected<S> {
        Rejected {
            session: self,
            error,
        }
    }
}

impl Session<Unauthenticated> {
    /// Start a session for `identity` whose cancellation follows `parent`.
    pub fn new(identity: Identity, parent: &CancellationToken) -> Self {
        Self {
            identity,
            created_at: Utc::now(),
            cancel: parent.child_token(),
            state: Unauthenticated,
        }
    }

    /// Verify `credential` with `provider`.
    ///
    /// The credential must resolve to this session's identity.
    pub async fn authenticate(
        self,
        provider: &dyn IdentityProvider,
        credential: &Credential,
    ) -> std::result::Result<Session<Authenticated>, Rejected<Unauthenticated>> {
        if credential.identity != self.identity {
            let msg = format!(
                "credential for {} presented on session {}",
                credential.identity, self.identity
            );
            return Err(self.reject(Error::authentication_failed(msg)));
        }

        match provider.authenticate(credential).await {
            Ok(principal) if principal.identity == self.identity => {
                tracing::debug!(
                    identity = %self.identity,
                    provider = provider.name(),
                    roles = ?principal.roles,
                    "session_authenticated"
                );
                Ok(self.advance(Authenticated { principal }))
            }
            Ok(principal) => {
                let msg = format!(
                    "provider {} resolved {} to {}",
                    provider.name(),
                    self.identity,
                    principal.identity
                );
                Err(self.reject(Error::authentication_failed(msg)))
            }
            Err(e) => {
                let error = match e {
                    Error::AuthenticationFailed(_) => e,
                    other => Error::authentication_failed(other.to_string()),
                };
                Err(self.reject(error))
            }
        }
    }
}

impl Session<Authenticated> {
    pub fn principal(&self) -> &Principal {
        &self.state.principal
    }

    /// Ask policy whether the principal may perform `action` on `resource`.
    pub fn authorize(
        self,
        policy: &Policy,
        action: &str,
        resource: &str,
    ) -> std::result::Result<Session<Authorized>, Rejected<Authenticated>> {
        let effect = policy.decide(&self.state.principal.roles, action, resource);
        if effect != Effect::Allow {
            let error = Error::not_authorized(format!(
                "{} may not {action} {resource}",
                self.identity
            ));
            return Err(self.reject(error));
        }

        tracing::debug!(identity = %self.identity, action, resource, "session_authorized");
        let Session {
            identity,
            created_at,
            cancel,
            state: Authenticated { principal },
        } = self;
        let grant = Grant {
            action: action.to_string(),
            resource: resource.to_string(),
        };
        Ok(Session {
            identity,
            created_at,
            cancel,
            state: Authorized {
                principal,
                grants: vec![grant],
            },
        })
    }
}

impl Session<Authorized> {
    pub fn principal(&self) -> &Principal {
        &self.state.principal
    }

    /// Everything policy has allowed this session so far.
    pub fn capabilities(&self) -> &[Grant] {
        &self.state.grants
    }

    /// Check `action` on `resource` against the current policy snapshot and
    /// return a capability for it.
    ///
    /// A denial leaves the session Authorized.
    pub fn permit(&mut self, policy: &Policy, action: &str, resource: &str) -> Result<Capability> {
        let effect = policy.decide(&self.state.principal.roles, action, resource);
        if effect != Effect::Allow {
            tracing::debug!(identity = %self.identity, action, resource, "permit_denied");
            return Err(Error::not_authorized(format!(
                "{} may not {action} {resource}",
                self.identity
            )));
        }

        let grant = Grant {
            action: action.to_string(),
            resource: resource.to_string(),
        };
        if !self.state.grants.contains(&grant) {
            self.state.grants.push(grant);
        }

        Ok(Capability {
            identity: self.identity.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
            cancel: self.cancel.clone(),
        })
    }
}

/// Proof that an Authorized session was allowed one `(action, resource)`.
///
/// Only [`Session::permit`] creates these.
#[derive(Debug, Clone)]
pub struct Capability {
    identity: Identity,
    action: String,
    resource: String,
    cancel: CancellationToken,
}

impl Capability {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn permits(&self, action: &str, resource: &str) -> bool {
        self.action == action && self.resource == resource
    }

    /// Cancelled when the issuing session closes or the daemon shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRule;
    use std::collections::HashMap;

    fn alice() -> Identity {
        Identity::new("alice").unwrap()
    }

    fn provider() -> StaticIdentityProvider {
        let mut map = HashMap::new();
        map.insert("alice".to_string(), vec!["user".to_string()]);
        StaticIdentityProvider::new(map, None)
    }

    fn policy() -> Policy {
        Policy::new(
            vec![
                PolicyRule::allow("user", "invoke", "echo"),
                PolicyRule::allow("user", "invoke", "time"),
            ],
            Effect::Deny,
        )
    }

    async fn authenticated() -> Session<Authenticated> {
        let root = CancellationToken::new();
        Session::new(alice(), &root)
            .authenticate(&provider(), &Credential::channel(alice()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let session = authenticated().await;
        assert_eq!(session.phase_name(), "authenticated");

        let mut session = session.authorize(&policy(), "invoke", "echo").unwrap();
        assert_eq!(session.phase_name(), "authorized");

        let cap = session.permit(&policy(), "invoke", "time").unwrap();
        assert!(cap.permits("invoke", "time"));
        assert!(!cap.permits("invoke", "echo"));
        assert_eq!(session.capabilities().len(), 2);

        let closed = session.close();
        assert_eq!(closed.from_phase(), "authorized");
        assert!(cap.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_authentication_returns_session() {
        let root = CancellationToken::new();
        let bob = Identity::new("bob").unwrap();
        let rejected = Session::new(bob.clone(), &root)
            .authenticate(&provider(), &Credential::channel(bob.clone()))
            .await
            .unwrap_err();

        let (session, error) = rejected.into_parts();
        assert_eq!(error.code(), "AUTHENTICATION_FAILED");
        assert_eq!(session.identity(), &bob);
        assert_eq!(session.phase_name(), "unauthenticated");
    }

    #[tokio::test]
    async fn test_mismatched_credential_rejected() {
        let root = CancellationToken::new();
        let rejected = Session::new(alice(), &root)
            .authenticate(
                &AllowAllIdentityProvider::default(),
                &Credential::channel(Identity::new("bob").unwrap()),
            )
            .await
            .unwrap_err();
        let (session, error) = rejected.into_parts();
        assert_eq!(error.code(), "AUTHENTICATION_FAILED");
        assert!(error.to_string().contains("credential for bob presented on session alice"));
        assert_eq!(session.identity(), &alice());
        assert_eq!(session.phase_name(), "unauthenticated");
    }

    #[tokio::test]
    async fn test_denied_authorization_keeps_authenticated_session() {
        let session = authenticated().await;
        let rejected = session.authorize(&policy(), "invoke", "shell").unwrap_err();

        assert_eq!(rejected.error.code(), "NOT_AUTHORIZED");
        // Retry with the returned session.
        let authorized = rejected.session.authorize(&policy(), "invoke", "echo");
        assert!(authorized.is_ok());
    }

    #[tokio::test]
    async fn test_permit_uses_current_snapshot() {
        let mut session = authenticated()
            .await
            .authorize(&policy(), "invoke", "echo")
            .unwrap();

        let revoked = Policy::default();
        let err = session.permit(&revoked, "invoke", "echo").unwrap_err();
        assert_eq!(err.code(), "NOT_AUTHORIZED");
        // Still authorized, still usable.
        assert!(session.permit(&policy(), "invoke", "echo").is_ok());
    }

    #[tokio::test]
    async fn test_root_cancellation_reaches_capability() {
        let root = CancellationToken::new();
        let mut session = Session::new(alice(), &root)
            .authenticate(&provider(), &Credential::channel(alice()))
            .await
            .unwrap()
            .authorize(&policy(), "invoke", "echo")
            .unwrap();
        let cap = session.permit(&policy(), "invoke", "echo").unwrap();

        root.cancel();
        assert!(cap.cancellation().is_cancelled());
    }

    #[test]
    fn test_close_from_unauthenticated() {
        let root = CancellationToken::new();
        let session = Session::new(alice(), &root);
        let token = session.cancellation().clone();
        let closed = session.close();
        assert_eq!(closed.from_phase(), "unauthenticated");
        assert!(token.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
