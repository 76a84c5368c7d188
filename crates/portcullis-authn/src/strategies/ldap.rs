//! LDAP bind authentication, the `authn-ldap` type.
//!
//! Delegates credential verification to a directory bind. A blank password
//! is rejected before any directory traffic: many directories treat a bind
//! with an empty password as a successful unauthenticated bind, which would
//! turn "no password" into "valid login".

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    strategies::{Authenticator, VerifiedIdentity},
};

/// A directory that can attempt a simple bind.
#[async_trait]
pub trait DirectoryConnection: Send + Sync {
    /// Attempts to bind as `login` with `password`. `Ok(false)` means the
    /// directory rejected the credentials; `Err` means it could not be
    /// reached.
    async fn bind(&self, login: &str, password: &str) -> Result<bool>;
}

/// The `authn-ldap` strategy.
pub struct LdapAuthenticator {
    directory: Arc<dyn DirectoryConnection>,
}

impl LdapAuthenticator {
    /// Creates the strategy over the given directory.
    pub fn new(directory: Arc<dyn DirectoryConnection>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Authenticator for LdapAuthenticator {
    fn name(&self) -> &'static str {
        "authn-ldap"
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        if input.username.trim().is_empty() {
            return Err(AuthnError::InvalidCredentials);
        }
        // Reject before any bind attempt.
        if input.credentials.trim().is_empty() {
            return Err(AuthnError::InvalidCredentials);
        }

        let bound = self.directory.bind(&input.username, &input.credentials).await?;
        if !bound {
            return Err(AuthnError::InvalidCredentials);
        }

        tracing::debug!(username = %input.username, "LDAP bind succeeded");
        Ok(VerifiedIdentity::new(&input.username))
    }
}
