//! Built-in API key authentication, the `authn` type.
//!
//! Always available even when no whitelist is configured: every role may
//! hold an API key and exchange it for an access token. Comparison is
//! constant-time; a missing role and a wrong key are indistinguishable to
//! the caller.

use std::sync::Arc;

use async_trait::async_trait;
use portcullis_store::StorageError;
use subtle::ConstantTimeEq;

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    strategies::{Authenticator, VerifiedIdentity},
};

/// Source of per-role API keys.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// The API key for `login` under `account`, or `Ok(None)` when the role
    /// has no key.
    async fn api_key(
        &self,
        account: &str,
        login: &str,
    ) -> std::result::Result<Option<String>, StorageError>;
}

/// In-memory [`ApiKeyStore`] for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryApiKeyStore {
    keys: std::sync::RwLock<std::collections::HashMap<(String, String), String>>,
}

impl MemoryApiKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key for a login.
    pub fn set_api_key(&self, account: &str, login: &str, key: &str) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((account.to_string(), login.to_string()), key.to_string());
    }
}

#[async_trait]
impl ApiKeyStore for MemoryApiKeyStore {
    async fn api_key(
        &self,
        account: &str,
        login: &str,
    ) -> std::result::Result<Option<String>, StorageError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(&(account.to_string(), login.to_string())).cloned())
    }
}

/// The default `authn` strategy.
pub struct ApiKeyAuthenticator {
    store: Arc<dyn ApiKeyStore>,
}

impl ApiKeyAuthenticator {
    /// Creates the strategy over the given key store.
    pub fn new(store: Arc<dyn ApiKeyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    fn name(&self) -> &'static str {
        "authn"
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        if input.credentials.trim().is_empty() {
            return Err(AuthnError::InvalidCredentials);
        }

        let stored = self.store.api_key(&input.account, &input.username).await?;
        // Unknown role and wrong key take the same path.
        let Some(stored) = stored else {
            return Err(AuthnError::InvalidCredentials);
        };
        if !bool::from(stored.as_bytes().ct_eq(input.credentials.as_bytes())) {
            return Err(AuthnError::InvalidCredentials);
        }

        Ok(VerifiedIdentity::new(&input.username))
    }
}
