//! JWKS fetching and caching.
//!
//! External token issuers publish their verification keys as a JSON Web Key
//! Set. [`JwksCache`] caches fetched sets per URI with a TTL, deduplicates
//! concurrent fetches for the same URI, and forces exactly one refresh when
//! a token names a `kid` the cached set does not carry (key rotation).
//!
//! The network edge is behind [`JwksFetcher`] so verification logic can be
//! exercised against in-memory key sets.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey};
use moka::future::Cache;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::error::{AuthnError, Result};

/// JSON Web Key as defined in RFC 7517, limited to the signature key types
/// accepted here.
#[derive(Clone, Debug, Deserialize)]
pub struct Jwk {
    /// Key type: `OKP` for EdDSA, `RSA` for RS256
    pub kty: String,

    /// Key ID
    pub kid: String,

    /// Declared algorithm, if the issuer publishes one
    #[serde(default)]
    pub alg: Option<String>,

    /// Base64url raw public key (EdDSA)
    #[serde(default)]
    pub x: Option<String>,

    /// RSA modulus
    #[serde(default)]
    pub n: Option<String>,

    /// RSA exponent
    #[serde(default)]
    pub e: Option<String>,
}

impl Jwk {
    /// Converts the JWK into a [`DecodingKey`].
    pub fn to_decoding_key(&self) -> Result<DecodingKey> {
        match self.kty.as_str() {
            "OKP" => {
                let x = self
                    .x
                    .as_ref()
                    .ok_or_else(|| AuthnError::JwksError("OKP key missing 'x'".into()))?;
                let key_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(x)
                    .map_err(|e| AuthnError::JwksError(format!("bad EdDSA public key: {e}")))?;

                // Wrap the raw 32-byte key in SubjectPublicKeyInfo DER, then
                // PEM; jsonwebtoken only parses Ed25519 keys from PEM.
                let mut der = vec![
                    0x30, 0x2a, // SEQUENCE, 42 bytes
                    0x30, 0x05, // SEQUENCE, 5 bytes
                    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
                    0x03, 0x21, 0x00, // BIT STRING, 33 bytes
                ];
                der.extend_from_slice(&key_bytes);
                let pem = format!(
                    "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----",
                    base64::engine::general_purpose::STANDARD.encode(&der)
                );

                DecodingKey::from_ed_pem(pem.as_bytes())
                    .map_err(|e| AuthnError::JwksError(format!("bad EdDSA decoding key: {e}")))
            }
            "RSA" => {
                let n = self
                    .n
                    .as_ref()
                    .ok_or_else(|| AuthnError::JwksError("RSA key missing 'n'".into()))?;
                let e = self
                    .e
                    .as_ref()
                    .ok_or_else(|| AuthnError::JwksError("RSA key missing 'e'".into()))?;

                DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| AuthnError::JwksError(format!("bad RSA decoding key: {e}")))
            }
            other => Err(AuthnError::UnsupportedAlgorithm(format!("key type {other}"))),
        }
    }

    /// The algorithm this key verifies.
    pub fn algorithm(&self) -> Result<Algorithm> {
        match (self.kty.as_str(), self.alg.as_deref()) {
            ("OKP", Some("EdDSA") | None) => Ok(Algorithm::EdDSA),
            ("RSA", Some("RS256") | None) => Ok(Algorithm::RS256),
            ("RSA", Some("RS384")) => Ok(Algorithm::RS384),
            ("RSA", Some("RS512")) => Ok(Algorithm::RS512),
            (kty, alg) => Err(AuthnError::UnsupportedAlgorithm(format!(
                "{}/{}",
                kty,
                alg.unwrap_or("none")
            ))),
        }
    }
}

/// A parsed key set.
#[derive(Clone, Debug, Deserialize)]
pub struct JwksSet {
    /// The published keys
    pub keys: Vec<Jwk>,
}

impl JwksSet {
    /// Parses a key set from its JSON form. Used both for fetched documents
    /// and for key sets stored directly as configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let set: JwksSet = serde_json::from_str(json)
            .map_err(|e| AuthnError::JwksError(format!("failed to parse JWKS: {e}")))?;
        if set.keys.is_empty() {
            return Err(AuthnError::JwksError("JWKS contains no keys".into()));
        }
        Ok(set)
    }

    /// Finds a key by ID using constant-time comparison.
    pub fn key_by_id(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| bool::from(k.kid.as_bytes().ct_eq(kid.as_bytes())))
    }
}

/// Fetches a key set document from its source.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    /// Fetches and parses the key set at `uri`.
    async fn fetch(&self, uri: &str) -> Result<JwksSet>;
}

/// HTTPS fetcher used in production.
pub struct HttpJwksFetcher {
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Creates a fetcher with the given request timeout.
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthnError::JwksError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self, uri: &str) -> Result<JwksSet> {
        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(AuthnError::JwksError(format!(
                "JWKS fetch returned status {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        JwksSet::from_json(&body)
    }
}

/// TTL cache over a [`JwksFetcher`], keyed by source URI.
///
/// Concurrent misses for the same URI resolve to a single upstream fetch;
/// the losers of the race share the winner's result.
pub struct JwksCache {
    fetcher: Arc<dyn JwksFetcher>,
    cache: Cache<String, JwksSet>,
}

impl JwksCache {
    /// Creates a cache holding up to `capacity` key sets for `ttl` each.
    pub fn new(fetcher: Arc<dyn JwksFetcher>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(capacity).time_to_live(ttl).build();
        Self { fetcher, cache }
    }

    /// The key set published at `uri`, from cache or upstream.
    pub async fn key_set(&self, uri: &str) -> Result<JwksSet> {
        if let Some(cached) = self.cache.get(uri).await {
            crate::metrics::record_jwks_cache_hit(uri);
            return Ok(cached);
        }

        let fetcher = self.fetcher.clone();
        let uri_owned = uri.to_string();
        self.cache
            .try_get_with(uri_owned.clone(), async move {
                tracing::debug!(uri = %uri_owned, "JWKS cache miss, fetching");
                crate::metrics::record_jwks_cache_miss(&uri_owned);
                fetcher.fetch(&uri_owned).await
            })
            .await
            .map_err(|e: Arc<AuthnError>| AuthnError::JwksError(e.to_string()))
    }

    /// Resolves `kid` against the cached set; on a miss, invalidates and
    /// refetches exactly once before giving up. A rotated key thus costs one
    /// extra fetch, while a token forged with a random `kid` cannot trigger
    /// more than one.
    pub async fn key_by_id(&self, uri: &str, kid: &str) -> Result<Jwk> {
        let set = self.key_set(uri).await?;
        if let Some(key) = set.key_by_id(kid) {
            return Ok(key.clone());
        }

        tracing::info!(uri = %uri, kid = %kid, "kid not in cached JWKS, forcing refresh");
        self.cache.invalidate(uri).await;
        let set = self.key_set(uri).await?;
        set.key_by_id(kid).cloned().ok_or_else(|| AuthnError::KeyNotFound(kid.to_string()))
    }
}
