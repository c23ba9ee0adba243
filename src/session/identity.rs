//! Identity providers.
//!
//! A provider turns a channel credential into a [`Principal`] (identity plus
//! roles). Two implementations ship with the core:
//! - `StaticIdentityProvider`: identity → roles table from configuration
//! - `AllowAllIdentityProvider`: accepts everyone, for development only

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{Error, IdentityConfig, Identity, Result};

/// What a sender presents on first contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub identity: Identity,
    /// Optional channel-supplied proof. Providers may ignore it.
    pub token: Option<String>,
}

impl Credential {
    /// Credential attributed by the channel itself.
    pub fn channel(identity: Identity) -> Self {
        Self {
            identity,
            token: None,
        }
    }
}

/// An authenticated identity and the roles it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub identity: Identity,
    pub roles: Vec<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Validate `credential` and resolve its roles.
    async fn authenticate(&self, credential: &Credential) -> Result<Principal>;

    /// Pick up a new identity section. Providers without configuration ignore it.
    fn reload(&self, _config: &IdentityConfig) {}
}

// =============================================================================
// Static table
// =============================================================================

#[derive(Debug, Default)]
struct RoleTable {
    role_map: HashMap<String, Vec<String>>,
    default_role: Option<String>,
}

/// Roles come from a fixed table; unknown identities get the default role
/// or are rejected when there is none.
#[derive(Debug)]
pub struct StaticIdentityProvider {
    table: ArcSwap<RoleTable>,
}

impl StaticIdentityProvider {
    pub fn new(role_map: HashMap<String, Vec<String>>, default_role: Option<String>) -> Self {
        Self {
            table: ArcSwap::new(Arc::new(RoleTable {
                role_map,
                default_role,
            })),
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self::new(config.role_map.clone(), config.default_role.clone())
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn authenticate(&self, credential: &Credential) -> Result<Principal> {
        let table = self.table.load();
        let roles = match table.role_map.get(credential.identity.as_str()) {
            Some(roles) => roles.clone(),
            None => match &table.default_role {
                Some(role) => vec![role.clone()],
                None => {
                    return Err(Error::authentication_failed(format!(
                        "unknown identity {}",
                        credential.identity
                    )))
                }
            },
        };

        Ok(Principal {
            identity: credential.identity.clone(),
            roles,
        })
    }

    fn reload(&self, config: &IdentityConfig) {
        self.table.store(Arc::new(RoleTable {
            role_map: config.role_map.clone(),
            default_role: config.default_role.clone(),
        }));
        tracing::debug!(identities = config.role_map.len(), "identity_table_reloaded");
    }
}

// =============================================================================
// Permissive
// =============================================================================

/// Accepts every credential and grants a fixed role set.
///
/// Only use in development or trusted environments.
#[derive(Debug)]
pub struct AllowAllIdentityProvider {
    roles: Vec<String>,
}

impl AllowAllIdentityProvider {
    pub fn new(roles: Vec<String>) -> Self {
        tracing::warn!(
            ?roles,
            "AllowAllIdentityProvider enabled - every sender is authenticated"
        );
        Self { roles }
    }
}

impl Default for AllowAllIdentityProvider {
    fn default() -> Self {
        Self::new(vec!["user".to_string()])
    }
}

#[async_trait]
impl IdentityProvider for AllowAllIdentityProvider {
    fn name(&self) -> &str {
        "allow-all"
    }

    async fn authenticate(&self, credential: &Credential) -> Result<Principal> {
        Ok(Principal {
            identity: credential.identity.clone(),
            roles: self.roles.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(id: &str) -> Credential {
        Credential::channel(Identity::new(id).unwrap())
    }

    #[tokio::test]
    async fn test_static_provider_maps_roles() {
        let mut map = HashMap::new();
        map.insert("alice".to_string(), vec!["admin".to_string(), "user".to_string()]);
        let provider = StaticIdentityProvider::new(map, None);

        let principal = provider.authenticate(&cred("alice")).await.unwrap();
        assert_eq!(principal.roles, vec!["admin", "user"]);

        let err = provider.authenticate(&cred("mallory")).await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    }

    #[tokio::test]
    async fn test_static_provider_default_role_and_reload() {
        let provider = StaticIdentityProvider::new(HashMap::new(), Some("guest".into()));
        let principal = provider.authenticate(&cred("bob")).await.unwrap();
        assert_eq!(principal.roles, vec!["guest"]);

        provider.reload(&IdentityConfig::default());
        assert!(provider.authenticate(&cred("bob")).await.is_err());
    }

    #[tokio::test]
    async fn test_allow_all_accepts_anyone() {
        let provider = AllowAllIdentityProvider::default();
        let principal = provider.authenticate(&cred("anyone")).await.unwrap();
        assert_eq!(principal.identity.as_str(), "anyone");
        assert_eq!(principal.roles, vec!["user"]);
    }
}
