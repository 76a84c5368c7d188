//! Access token issuance.
//!
//! A successful authentication ends with a short-lived signed token naming
//! the account and authenticated identity. The wire form is a three-field
//! JSON envelope: `data` is the base64url claims payload, `signature` the
//! Ed25519 signature over the raw payload bytes, `key` the fingerprint of
//! the signing key so verifiers can pick the right key across rotations.
//! Hosts and users get different lifetimes since machine identities
//! re-authenticate on a tight loop.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use portcullis_store::SigningKeyStore;

use crate::error::{AuthnError, Result};

/// Claims carried by an issued token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Tenant account the token is scoped to
    pub account: String,
    /// Authenticated identity, login form (`host/` prefix preserved)
    pub sub: String,
    /// Issued at, seconds since epoch
    pub iat: i64,
    /// Expiration, seconds since epoch
    pub exp: i64,
}

/// A signed, encoded token ready to hand to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedToken {
    /// Base64url encoded claims JSON
    pub data: String,
    /// Base64url encoded Ed25519 signature over the raw claims bytes
    pub signature: String,
    /// Fingerprint of the signing key
    pub key: String,
}

impl SignedToken {
    /// Decodes the claims without verifying the signature. Only for logging
    /// and tests; authorization decisions go through [`SignedToken::verify`].
    pub fn claims_unverified(&self) -> Result<TokenClaims> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.data)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad payload encoding: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad payload JSON: {e}")))
    }

    /// Verifies the signature and expiry, returning the claims.
    ///
    /// # Errors
    ///
    /// [`AuthnError::InvalidSignature`] on a bad signature,
    /// [`AuthnError::TokenExpired`] when `exp` has passed.
    pub fn verify(&self, key: &VerifyingKey) -> Result<TokenClaims> {
        let payload = URL_SAFE_NO_PAD
            .decode(&self.data)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad payload encoding: {e}")))?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad signature encoding: {e}")))?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| AuthnError::InvalidSignature)?;
        key.verify(&payload, &signature).map_err(|_| AuthnError::InvalidSignature)?;

        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad payload JSON: {e}")))?;
        if Utc::now().timestamp() >= claims.exp {
            return Err(AuthnError::TokenExpired);
        }
        Ok(claims)
    }
}

/// Issues tokens from per-account signing keys.
pub struct TokenIssuer {
    signing_keys: Arc<dyn SigningKeyStore>,
    user_ttl_secs: i64,
    host_ttl_secs: i64,
}

impl TokenIssuer {
    /// Creates an issuer with separate user and host lifetimes, in seconds.
    pub fn new(
        signing_keys: Arc<dyn SigningKeyStore>,
        user_ttl_secs: u64,
        host_ttl_secs: u64,
    ) -> Self {
        Self {
            signing_keys,
            user_ttl_secs: user_ttl_secs as i64,
            host_ttl_secs: host_ttl_secs as i64,
        }
    }

    /// Issues a token for `username` under `account`.
    ///
    /// # Errors
    ///
    /// [`AuthnError::MissingSigningKey`] when the account has no provisioned
    /// key. This is fatal for the account and never collapses into a generic
    /// credential failure.
    pub async fn issue(&self, account: &str, username: &str) -> Result<SignedToken> {
        let key_pair = self
            .signing_keys
            .signing_key(account)
            .await?
            .ok_or_else(|| AuthnError::MissingSigningKey(account.to_string()))?;

        let now = Utc::now().timestamp();
        let is_host = username.starts_with("host/");
        let ttl = if is_host { self.host_ttl_secs } else { self.user_ttl_secs };
        let claims = TokenClaims {
            account: account.to_string(),
            sub: username.to_string(),
            iat: now,
            exp: now + ttl,
        };

        let payload = serde_json::to_vec(&claims)
            .map_err(|e| AuthnError::InvalidTokenFormat(e.to_string()))?;
        let signature = key_pair.signing_key().sign(&payload);

        crate::metrics::record_token_issued(account, is_host);
        tracing::debug!(
            account = %account,
            username = %username,
            ttl_secs = ttl,
            "Issued access token"
        );

        Ok(SignedToken {
            data: URL_SAFE_NO_PAD.encode(payload),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            key: key_pair.fingerprint.clone(),
        })
    }
}
