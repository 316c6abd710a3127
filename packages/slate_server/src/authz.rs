//! Authorization seam.
//!
//! The relay does not own identity. It asks a collaborator two questions:
//! who does this credential belong to, and what role do they hold in this
//! channel. Production deployments implement [`AuthService`] against their
//! identity backend; [`StaticAuth`] covers tests and single-user setups.

use std::collections::HashMap;

use async_trait::async_trait;
use slate_protocol::Role;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolve a connection credential to a principal id.
    /// `None` means the connection must be refused.
    async fn authenticate(&self, credential: &str) -> Option<String>;

    /// Role the principal holds within one channel. `None` means every
    /// message they send will be rejected (they may still receive).
    async fn role_for(&self, channel: &str, principal: &str) -> Option<Role>;
}

/// Fixed in-memory credential and grant tables.
#[derive(Default)]
pub struct StaticAuth {
    tokens: HashMap<String, String>,
    grants: HashMap<(String, String), Role>,
    default_role: Option<Role>,
    accept_any: bool,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept every credential as its own principal id and grant `role`
    /// in every channel. Development mode.
    pub fn allow_all(role: Role) -> Self {
        Self {
            accept_any: true,
            default_role: Some(role),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, credential: impl Into<String>, principal: impl Into<String>) -> Self {
        self.tokens.insert(credential.into(), principal.into());
        self
    }

    pub fn with_grant(
        mut self,
        channel: impl Into<String>,
        principal: impl Into<String>,
        role: Role,
    ) -> Self {
        self.grants.insert((channel.into(), principal.into()), role);
        self
    }

    /// Role granted when no per-channel grant exists.
    pub fn with_default_role(mut self, role: Role) -> Self {
        self.default_role = Some(role);
        self
    }
}

#[async_trait]
impl AuthService for StaticAuth {
    async fn authenticate(&self, credential: &str) -> Option<String> {
        if self.accept_any {
            return Some(credential.to_string());
        }
        self.tokens.get(credential).cloned()
    }

    async fn role_for(&self, channel: &str, principal: &str) -> Option<Role> {
        self.grants
            .get(&(channel.to_string(), principal.to_string()))
            .copied()
            .or(self.default_role)
    }
}
