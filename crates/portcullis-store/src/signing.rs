//! Per-account token signing keys.
//!
//! Every account owns one asymmetric key pair used to sign the access tokens
//! it issues. Only Ed25519 is supported; symmetric keys are rejected at the
//! type level by not existing here.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::error::StorageError;

/// An account's Ed25519 signing key pair.
#[derive(Clone)]
pub struct SigningKeyPair {
    /// Account the key belongs to
    pub account: String,
    /// Raw Ed25519 secret key bytes
    secret: [u8; 32],
    /// Key fingerprint: base64url of the public key bytes
    pub fingerprint: String,
}

impl SigningKeyPair {
    /// Wrap raw secret key bytes into a key pair.
    pub fn from_secret_bytes(account: &str, secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let fingerprint = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes());
        Self { account: account.to_string(), secret, fingerprint }
    }

    /// The Ed25519 signing key.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }

    /// The Ed25519 verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }

    /// PKCS#8 v1 DER encoding of the secret key, as expected by JWT
    /// encoding keys.
    pub fn to_pkcs8_der(&self) -> Vec<u8> {
        // Hand-rolled PKCS#8 wrapper for a raw Ed25519 seed:
        //   SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 },
        //              OCTET STRING { OCTET STRING seed } }
        let mut der = vec![
            0x30, 0x2e, // SEQUENCE, 46 bytes
            0x02, 0x01, 0x00, // INTEGER version 0
            0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
            0x04, 0x22, // OCTET STRING, 34 bytes
            0x04, 0x20, // OCTET STRING, 32 bytes (the seed)
        ];
        der.extend_from_slice(&self.secret);
        der
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret bytes stay out of debug output.
        f.debug_struct("SigningKeyPair")
            .field("account", &self.account)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Store of per-account signing key pairs.
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    /// The signing key pair for `account`, or `Ok(None)` if the account has
    /// no key provisioned. A missing key is unrecoverable for that account.
    async fn signing_key(&self, account: &str) -> Result<Option<SigningKeyPair>, StorageError>;
}
