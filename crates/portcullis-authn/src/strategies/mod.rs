//! Protocol-specific credential verifiers.
//!
//! Each strategy implements [`Authenticator`]: given an
//! [`AuthenticatorInput`] it either produces the verified identity or a
//! typed rejection. Strategies never touch the whitelist or privilege gates;
//! the dispatcher runs the security validator before any strategy code.

pub mod api_key;
pub mod iam;
pub mod jenkins;
pub mod jwt;
pub mod kubernetes;
pub mod ldap;
pub mod oidc;

use async_trait::async_trait;
use portcullis_store::PolicyStore;

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    webservice::Webservice,
};

/// The identity a strategy established, in login form (`host/` prefix
/// preserved for machine identities). Ephemeral; consumed immediately by
/// token issuance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Login-form identity
    pub username: String,
}

impl VerifiedIdentity {
    /// Wraps a login-form username.
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into() }
    }
}

/// A credential verifier for one authenticator type.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The authenticator type name this strategy serves, e.g. `authn-jwt`.
    fn name(&self) -> &'static str;

    /// Verifies the credentials in `input`, returning the identity they
    /// prove. Implementations map every upstream failure into the closed
    /// error taxonomy; raw transport errors never escape.
    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity>;
}

/// Reads a configuration variable of `webservice`, treating a declared but
/// empty value as a configuration error rather than an unset variable.
pub(crate) async fn variable(
    policy: &dyn PolicyStore,
    webservice: &Webservice,
    name: &str,
) -> Result<Option<String>> {
    match policy.secret(webservice.account(), &webservice.identifier(), name).await? {
        Some(value) if value.trim().is_empty() => {
            Err(AuthnError::MissingConfigurationVariable(name.to_string()))
        }
        other => Ok(other),
    }
}

/// Like [`variable`], but absence is also a configuration error.
pub(crate) async fn required_variable(
    policy: &dyn PolicyStore,
    webservice: &Webservice,
    name: &str,
) -> Result<String> {
    variable(policy, webservice, name)
        .await?
        .ok_or_else(|| AuthnError::MissingConfigurationVariable(name.to_string()))
}
