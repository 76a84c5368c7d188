//! Authenticator registry.
//!
//! The set of authenticator types is closed at compile time: an explicit
//! enum plus a construction table wired up at startup, rather than anything
//! discovered at runtime. Resolution is a map lookup; an unknown name is a
//! typed rejection, never a fallthrough.

use std::{collections::HashMap, sync::Arc};

use portcullis_config::DEFAULT_AUTHENTICATOR_NAME;

use crate::{
    error::{AuthnError, Result},
    strategies::Authenticator,
};

/// The authenticator types this build knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthenticatorKind {
    /// Built-in API key authentication, always available
    ApiKey,
    /// JWT bearer tokens verified against a JWKS
    Jwt,
    /// OIDC authorization-code flow
    Oidc,
    /// AWS IAM role verification via STS
    Iam,
    /// Kubernetes mutual-TLS bootstrap
    Kubernetes,
    /// LDAP bind
    Ldap,
    /// Jenkins build-signature verification
    Jenkins,
}

impl AuthenticatorKind {
    /// All kinds, in registration order.
    pub const ALL: [AuthenticatorKind; 7] = [
        AuthenticatorKind::ApiKey,
        AuthenticatorKind::Jwt,
        AuthenticatorKind::Oidc,
        AuthenticatorKind::Iam,
        AuthenticatorKind::Kubernetes,
        AuthenticatorKind::Ldap,
        AuthenticatorKind::Jenkins,
    ];

    /// The URL-facing name, as it appears in the whitelist and request path.
    pub fn url_name(&self) -> &'static str {
        match self {
            AuthenticatorKind::ApiKey => DEFAULT_AUTHENTICATOR_NAME,
            AuthenticatorKind::Jwt => "authn-jwt",
            AuthenticatorKind::Oidc => "authn-oidc",
            AuthenticatorKind::Iam => "authn-iam",
            AuthenticatorKind::Kubernetes => "authn-k8s",
            AuthenticatorKind::Ldap => "authn-ldap",
            AuthenticatorKind::Jenkins => "authn-jenkins",
        }
    }

    /// Parses a URL-facing name.
    pub fn from_url_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.url_name() == name)
    }
}

/// Maps authenticator names to their strategy implementations.
///
/// Built once at startup; [`AuthenticatorRegistry::register`] rejects names
/// no [`AuthenticatorKind`] claims, so a typo in wiring fails boot instead
/// of producing an unreachable authenticator.
#[derive(Default)]
pub struct AuthenticatorRegistry {
    strategies: HashMap<&'static str, Arc<dyn Authenticator>>,
}

impl AuthenticatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strategy under its own name.
    ///
    /// # Errors
    ///
    /// [`AuthnError::AuthenticatorNotRegistered`] when the strategy reports
    /// a name outside the known kinds.
    pub fn register(&mut self, strategy: Arc<dyn Authenticator>) -> Result<()> {
        let name = strategy.name();
        if AuthenticatorKind::from_url_name(name).is_none() {
            return Err(AuthnError::AuthenticatorNotRegistered(name.to_string()));
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    /// Resolves a strategy by URL-facing name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Authenticator>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| AuthnError::AuthenticatorNotRegistered(name.to_string()))
    }

    /// The names currently registered, sorted.
    pub fn registered_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.strategies.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
