//! Authenticated caller identity.
//!
//! User management (registration, password hashing, key issuance) is an
//! external collaborator. The platform consumes an opaque [`Principal`] and a
//! token-resolution contract; the bundled [`StaticKeyAuthenticator`] resolves
//! long-lived API keys from configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::id::{PrincipalId, RunId};

/// What a principal is allowed to stand in for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "runId")]
pub enum PrincipalKind {
    /// A human or SDK caller holding a session token or API key.
    User,
    /// A trusted internal caller (runtime driver, operator tooling).
    Service,
    /// A container authenticating with its per-run token.
    Run(RunId),
}

/// The authenticated identity associated with an API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal identifier.
    pub id: PrincipalId,
    /// Capability class of this principal.
    pub kind: PrincipalKind,
}

impl Principal {
    /// Creates a user principal.
    #[must_use]
    pub fn user(id: PrincipalId) -> Self {
        Self {
            id,
            kind: PrincipalKind::User,
        }
    }

    /// Creates a trusted service principal.
    #[must_use]
    pub fn service(id: PrincipalId) -> Self {
        Self {
            id,
            kind: PrincipalKind::Service,
        }
    }

    /// Creates a run-scoped principal for container callbacks.
    #[must_use]
    pub fn for_run(id: PrincipalId, run_id: RunId) -> Self {
        Self {
            id,
            kind: PrincipalKind::Run(run_id),
        }
    }

    /// Returns true for trusted internal callers.
    #[must_use]
    pub fn is_service(&self) -> bool {
        matches!(self.kind, PrincipalKind::Service)
    }

    /// Returns true when this principal may issue trusted updates for `run_id`.
    #[must_use]
    pub fn may_drive_run(&self, run_id: &RunId) -> bool {
        match &self.kind {
            PrincipalKind::Service => true,
            PrincipalKind::Run(scoped) => scoped == run_id,
            PrincipalKind::User => false,
        }
    }
}

/// Token-resolution contract supplied by the auth collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolves a bearer token to a principal.
    ///
    /// Returns `None` for unknown tokens; errors are reserved for the
    /// collaborator itself being unavailable.
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>>;
}

/// Authenticator backed by a fixed token → principal table.
///
/// Suitable for self-hosted single-tenant deployments where API keys are
/// provisioned through configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, Principal>,
}

impl StaticKeyAuthenticator {
    /// Creates an empty authenticator (every token is rejected).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for a principal.
    #[must_use]
    pub fn with_key(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.keys.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>> {
        Ok(self.keys.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_keys_resolve() {
        let principal = Principal::user(PrincipalId::generate());
        let auth = StaticKeyAuthenticator::new().with_key("cp_abc", principal.clone());

        assert_eq!(
            auth.authenticate("cp_abc").await.unwrap(),
            Some(principal)
        );
        assert_eq!(auth.authenticate("cp_nope").await.unwrap(), None);
    }

    #[test]
    fn run_scoped_principal_drives_only_its_run() {
        let run = RunId::generate();
        let other = RunId::generate();
        let principal = Principal::for_run(PrincipalId::generate(), run.clone());

        assert!(principal.may_drive_run(&run));
        assert!(!principal.may_drive_run(&other));
        assert!(Principal::service(PrincipalId::generate()).may_drive_run(&other));
    }
}
