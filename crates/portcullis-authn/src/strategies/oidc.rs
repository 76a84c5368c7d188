//! OIDC authorization-code authentication, the `authn-oidc` type.
//!
//! Two phases. `authorize` builds the provider redirect with a fresh
//! `state`/`nonce` pair and a PKCE S256 challenge, recording the pending
//! authorization under its state. `verify` handles the callback: the state
//! must match a pending authorization (one use, bounded lifetime), the code
//! is exchanged at the token endpoint with the recorded verifier, and the
//! returned `id_token` is verified against the provider's discovered JWKS,
//! issuer, client id, and the recorded nonce. The identity comes from a
//! configurable claim, `preferred_username` by default.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use moka::future::Cache;
use portcullis_store::PolicyStore;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    jwks::JwksCache,
    strategies::{Authenticator, VerifiedIdentity, required_variable, variable},
    webservice::Webservice,
};

/// Provider metadata from the discovery document.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    /// Issuer identifier, must match `iss` in issued tokens
    pub issuer: String,
    /// Where to send the user for authorization
    pub authorization_endpoint: String,
    /// Where to exchange the code
    pub token_endpoint: String,
    /// Where the provider publishes its keys
    pub jwks_uri: String,
}

/// Code-for-token exchange request.
#[derive(Clone, Debug)]
pub struct TokenRequest {
    /// The authorization code from the callback
    pub code: String,
    /// The PKCE verifier recorded at authorize time
    pub code_verifier: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Registered redirect URI
    pub redirect_uri: String,
}

/// Token endpoint response; only the `id_token` matters here.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// The signed identity token
    pub id_token: String,
}

/// Provider-facing HTTP operations, behind a trait so the flow can run
/// against a fake provider in tests.
#[async_trait]
pub trait OidcProviderClient: Send + Sync {
    /// Fetches `{provider_uri}/.well-known/openid-configuration`.
    async fn discover(&self, provider_uri: &str) -> Result<ProviderConfig>;

    /// Exchanges an authorization code for tokens.
    async fn exchange_code(&self, token_endpoint: &str, request: &TokenRequest)
    -> Result<TokenResponse>;
}

/// Production provider client.
pub struct HttpOidcProviderClient {
    client: reqwest::Client,
}

impl HttpOidcProviderClient {
    /// Creates a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            AuthnError::OidcDiscoveryFailed(format!("failed to create HTTP client: {e}"))
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OidcProviderClient for HttpOidcProviderClient {
    async fn discover(&self, provider_uri: &str) -> Result<ProviderConfig> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            provider_uri.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthnError::OidcDiscoveryFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthnError::OidcDiscoveryFailed(format!(
                "discovery returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthnError::OidcDiscoveryFailed(format!("bad discovery document: {e}")))
    }

    async fn exchange_code(
        &self,
        token_endpoint: &str,
        request: &TokenRequest,
    ) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", &request.code),
            ("code_verifier", &request.code_verifier),
            ("client_id", &request.client_id),
            ("client_secret", &request.client_secret),
            ("redirect_uri", &request.redirect_uri),
        ];
        let response = self.client.post(token_endpoint).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(AuthnError::InvalidCredentials);
        }
        response
            .json()
            .await
            .map_err(|e| AuthnError::InvalidTokenFormat(format!("bad token response: {e}")))
    }
}

/// Per-instance settings from webservice variables.
struct OidcSettings {
    provider_uri: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    claim_mapping: String,
}

impl OidcSettings {
    async fn load(policy: &dyn PolicyStore, webservice: &Webservice) -> Result<Self> {
        Ok(Self {
            provider_uri: required_variable(policy, webservice, "provider-uri").await?,
            client_id: required_variable(policy, webservice, "client-id").await?,
            client_secret: required_variable(policy, webservice, "client-secret").await?,
            redirect_uri: required_variable(policy, webservice, "redirect-uri").await?,
            claim_mapping: variable(policy, webservice, "claim-mapping")
                .await?
                .unwrap_or_else(|| "preferred_username".to_string()),
        })
    }
}

/// A recorded authorize-phase session awaiting its callback.
struct PendingAuthorization {
    nonce: String,
    code_verifier: String,
    created_at: Instant,
}

/// What `authorize` hands back to the caller.
#[derive(Clone, Debug)]
pub struct AuthorizationRedirect {
    /// Full provider URL to redirect the user to
    pub url: String,
    /// The state the callback must present
    pub state: String,
}

/// The `authn-oidc` strategy.
pub struct OidcAuthenticator {
    policy: Arc<dyn PolicyStore>,
    provider: Arc<dyn OidcProviderClient>,
    jwks: Arc<JwksCache>,
    discovery_cache: Cache<String, ProviderConfig>,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
    session_ttl: Duration,
    clock_skew_secs: u64,
}

impl OidcAuthenticator {
    /// Creates the strategy. `session_ttl` bounds how long a pending
    /// authorization waits for its callback.
    pub fn new(
        policy: Arc<dyn PolicyStore>,
        provider: Arc<dyn OidcProviderClient>,
        jwks: Arc<JwksCache>,
        session_ttl: Duration,
        clock_skew_secs: u64,
    ) -> Self {
        let discovery_cache =
            Cache::builder().max_capacity(100).time_to_live(Duration::from_secs(86400)).build();
        Self {
            policy,
            provider,
            jwks,
            discovery_cache,
            pending: Mutex::new(HashMap::new()),
            session_ttl,
            clock_skew_secs,
        }
    }

    async fn provider_config(&self, provider_uri: &str) -> Result<ProviderConfig> {
        if let Some(cached) = self.discovery_cache.get(provider_uri).await {
            return Ok(cached);
        }
        let config = self.provider.discover(provider_uri).await?;
        self.discovery_cache.insert(provider_uri.to_string(), config.clone()).await;
        Ok(config)
    }

    /// Phase 1: builds the provider redirect and records the pending
    /// authorization.
    pub async fn authorize(&self, webservice: &Webservice) -> Result<AuthorizationRedirect> {
        let settings = OidcSettings::load(self.policy.as_ref(), webservice).await?;
        let config = self.provider_config(&settings.provider_uri).await?;

        let state = random_token(32);
        let nonce = random_token(32);
        let code_verifier = random_token(64);
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        let mut url = url::Url::parse(&config.authorization_endpoint)
            .map_err(|e| AuthnError::OidcDiscoveryFailed(format!("bad authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &settings.client_id)
            .append_pair("redirect_uri", &settings.redirect_uri)
            .append_pair("scope", "openid profile email")
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, session| session.created_at.elapsed() < self.session_ttl);
        pending.insert(
            state.clone(),
            PendingAuthorization { nonce, code_verifier, created_at: Instant::now() },
        );
        drop(pending);

        tracing::debug!(webservice = %webservice.name(), "OIDC authorization started");
        Ok(AuthorizationRedirect { url: url.into(), state })
    }

    /// Removes and returns the pending authorization for `state`. Expired
    /// and unknown states take the same path.
    fn take_pending(&self, state: &str) -> Result<PendingAuthorization> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let session = pending.remove(state).ok_or(AuthnError::StateMismatch)?;
        if session.created_at.elapsed() >= self.session_ttl {
            return Err(AuthnError::StateMismatch);
        }
        Ok(session)
    }

    async fn verify_id_token(
        &self,
        id_token: &str,
        config: &ProviderConfig,
        settings: &OidcSettings,
        expected_nonce: &str,
    ) -> Result<serde_json::Value> {
        let header = decode_header(id_token)?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthnError::InvalidTokenFormat("id_token has no kid".into()))?;
        let jwk = self.jwks.key_by_id(&config.jwks_uri, kid).await?;
        let algorithm = jwk.algorithm()?;
        if algorithm != header.alg {
            return Err(AuthnError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = self.clock_skew_secs;
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&settings.client_id]);
        let decoded = decode::<serde_json::Value>(id_token, &jwk.to_decoding_key()?, &validation)?;
        let claims = decoded.claims;

        match claims.get("nonce").and_then(serde_json::Value::as_str) {
            Some(nonce) if nonce == expected_nonce => Ok(claims),
            _ => Err(AuthnError::NonceMismatch),
        }
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn name(&self) -> &'static str {
        "authn-oidc"
    }

    /// Phase 2: the callback.
    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        let code = input
            .parameter("code")
            .ok_or_else(|| AuthnError::InvalidTokenFormat("missing code parameter".into()))?
            .to_string();
        let state = input
            .parameter("state")
            .ok_or_else(|| AuthnError::InvalidTokenFormat("missing state parameter".into()))?;

        let session = self.take_pending(state)?;

        let webservice = input.webservice();
        let settings = OidcSettings::load(self.policy.as_ref(), &webservice).await?;
        let config = self.provider_config(&settings.provider_uri).await?;

        let tokens = self
            .provider
            .exchange_code(
                &config.token_endpoint,
                &TokenRequest {
                    code,
                    code_verifier: session.code_verifier,
                    client_id: settings.client_id.clone(),
                    client_secret: settings.client_secret.clone(),
                    redirect_uri: settings.redirect_uri.clone(),
                },
            )
            .await?;

        let claims =
            self.verify_id_token(&tokens.id_token, &config, &settings, &session.nonce).await?;

        let username = claims
            .get(settings.claim_mapping.as_str())
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AuthnError::MissingClaim(settings.claim_mapping.clone()))?;

        tracing::debug!(username = %username, "OIDC callback verified");
        Ok(VerifiedIdentity::new(username))
    }
}

fn random_token(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use portcullis_store::{MemoryPolicyStore, SigningKeyPair};
    use rand_core::OsRng;
    use serde_json::json;

    use super::*;
    use crate::jwks::{JwksFetcher, JwksSet};

    const WS_PARENT: &str = "conjur/authn-oidc/keycloak";
    const PROVIDER: &str = "https://keycloak.example.com/realms/main";

    fn provider_pair() -> SigningKeyPair {
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        SigningKeyPair::from_secret_bytes("idp", key.to_bytes())
    }

    struct StaticJwksFetcher {
        jwks_json: String,
    }

    #[async_trait]
    impl JwksFetcher for StaticJwksFetcher {
        async fn fetch(&self, _uri: &str) -> Result<JwksSet> {
            JwksSet::from_json(&self.jwks_json)
        }
    }

    /// Fake provider: discovery is static, the exchange hands out a signed
    /// id_token carrying whatever nonce the test recorded.
    struct FakeProvider {
        pair: SigningKeyPair,
        /// nonce to embed; set after authorize
        nonce: Mutex<String>,
        username: &'static str,
    }

    #[async_trait]
    impl OidcProviderClient for FakeProvider {
        async fn discover(&self, provider_uri: &str) -> Result<ProviderConfig> {
            Ok(ProviderConfig {
                issuer: provider_uri.to_string(),
                authorization_endpoint: format!("{provider_uri}/protocol/openid-connect/auth"),
                token_endpoint: format!("{provider_uri}/protocol/openid-connect/token"),
                jwks_uri: format!("{provider_uri}/protocol/openid-connect/certs"),
            })
        }

        async fn exchange_code(
            &self,
            _token_endpoint: &str,
            request: &TokenRequest,
        ) -> Result<TokenResponse> {
            if request.code != "good-code" {
                return Err(AuthnError::InvalidCredentials);
            }
            let now = chrono::Utc::now().timestamp();
            let claims = json!({
                "iss": PROVIDER,
                "aud": request.client_id,
                "sub": "user-uuid",
                "preferred_username": self.username,
                "nonce": *self.nonce.lock().unwrap(),
                "iat": now,
                "exp": now + 300,
            });
            let mut header = Header::new(Algorithm::EdDSA);
            header.kid = Some("op-key".to_string());
            let key = EncodingKey::from_ed_der(&self.pair.to_pkcs8_der());
            Ok(TokenResponse { id_token: encode(&header, &claims, &key).unwrap() })
        }
    }

    fn configured_store() -> MemoryPolicyStore {
        let store = MemoryPolicyStore::new();
        store.set_secret("cucumber", WS_PARENT, "provider-uri", PROVIDER);
        store.set_secret("cucumber", WS_PARENT, "client-id", "portcullis");
        store.set_secret("cucumber", WS_PARENT, "client-secret", "s3cret");
        store.set_secret("cucumber", WS_PARENT, "redirect-uri", "https://portcullis.example.com/callback");
        store
    }

    fn strategy(pair: &SigningKeyPair, username: &'static str) -> (OidcAuthenticator, Arc<FakeProvider>) {
        let jwks_json = format!(
            r#"{{"keys":[{{"kty":"OKP","crv":"Ed25519","kid":"op-key","x":"{}"}}]}}"#,
            pair.fingerprint
        );
        let provider = Arc::new(FakeProvider {
            pair: pair.clone(),
            nonce: Mutex::new(String::new()),
            username,
        });
        let jwks = Arc::new(JwksCache::new(
            Arc::new(StaticJwksFetcher { jwks_json }),
            Duration::from_secs(300),
            10,
        ));
        let authenticator = OidcAuthenticator::new(
            Arc::new(configured_store()),
            provider.clone(),
            jwks,
            Duration::from_secs(300),
            60,
        );
        (authenticator, provider)
    }

    fn webservice() -> Webservice {
        Webservice::new("cucumber", "authn-oidc", Some("keycloak"))
    }

    fn callback_input(state: &str, code: &str) -> AuthenticatorInput {
        AuthenticatorInput {
            authenticator_name: "authn-oidc".into(),
            service_id: Some("keycloak".into()),
            account: "cucumber".into(),
            username: String::new(),
            credentials: String::new(),
            client_ip: "10.0.0.5".into(),
            parameters: vec![
                ("code".into(), code.into()),
                ("state".into(), state.into()),
            ],
        }
    }

    fn nonce_from_redirect(redirect: &AuthorizationRedirect) -> String {
        let url = url::Url::parse(&redirect.url).unwrap();
        url.query_pairs().find(|(k, _)| k == "nonce").map(|(_, v)| v.into_owned()).unwrap()
    }

    #[tokio::test]
    async fn test_full_authorization_code_flow() {
        let pair = provider_pair();
        let (strategy, provider) = strategy(&pair, "alice");

        let redirect = strategy.authorize(&webservice()).await.unwrap();
        *provider.nonce.lock().unwrap() = nonce_from_redirect(&redirect);

        let url = url::Url::parse(&redirect.url).unwrap();
        let params: HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["code_challenge_method"], "S256");
        assert!(params.contains_key("code_challenge"));

        let identity =
            strategy.verify(&callback_input(&redirect.state, "good-code")).await.unwrap();
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn test_unknown_state_is_rejected() {
        let pair = provider_pair();
        let (strategy, _) = strategy(&pair, "alice");

        let result = strategy.verify(&callback_input("forged-state", "good-code")).await;
        assert!(matches!(result, Err(AuthnError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let pair = provider_pair();
        let (strategy, provider) = strategy(&pair, "alice");

        let redirect = strategy.authorize(&webservice()).await.unwrap();
        *provider.nonce.lock().unwrap() = nonce_from_redirect(&redirect);

        strategy.verify(&callback_input(&redirect.state, "good-code")).await.unwrap();
        let replay = strategy.verify(&callback_input(&redirect.state, "good-code")).await;
        assert!(matches!(replay, Err(AuthnError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_wrong_nonce_in_id_token() {
        let pair = provider_pair();
        let (strategy, provider) = strategy(&pair, "alice");

        let redirect = strategy.authorize(&webservice()).await.unwrap();
        *provider.nonce.lock().unwrap() = "some-other-nonce".to_string();

        let result = strategy.verify(&callback_input(&redirect.state, "good-code")).await;
        assert!(matches!(result, Err(AuthnError::NonceMismatch)));
    }

    #[tokio::test]
    async fn test_bad_code_fails_exchange() {
        let pair = provider_pair();
        let (strategy, provider) = strategy(&pair, "alice");

        let redirect = strategy.authorize(&webservice()).await.unwrap();
        *provider.nonce.lock().unwrap() = nonce_from_redirect(&redirect);

        let result = strategy.verify(&callback_input(&redirect.state, "bad-code")).await;
        assert!(matches!(result, Err(AuthnError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_expired_session_is_state_mismatch() {
        let pair = provider_pair();
        let jwks_json = format!(
            r#"{{"keys":[{{"kty":"OKP","crv":"Ed25519","kid":"op-key","x":"{}"}}]}}"#,
            pair.fingerprint
        );
        let provider = Arc::new(FakeProvider {
            pair: pair.clone(),
            nonce: Mutex::new(String::new()),
            username: "alice",
        });
        let jwks = Arc::new(JwksCache::new(
            Arc::new(StaticJwksFetcher { jwks_json }),
            Duration::from_secs(300),
            10,
        ));
        let strategy = OidcAuthenticator::new(
            Arc::new(configured_store()),
            provider.clone(),
            jwks,
            Duration::from_millis(10),
            60,
        );

        let redirect = strategy.authorize(&webservice()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = strategy.verify(&callback_input(&redirect.state, "good-code")).await;
        assert!(matches!(result, Err(AuthnError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_missing_claim_mapping_value() {
        let pair = provider_pair();
        let jwks_json = format!(
            r#"{{"keys":[{{"kty":"OKP","crv":"Ed25519","kid":"op-key","x":"{}"}}]}}"#,
            pair.fingerprint
        );
        let provider = Arc::new(FakeProvider {
            pair: pair.clone(),
            nonce: Mutex::new(String::new()),
            username: "alice",
        });
        let jwks = Arc::new(JwksCache::new(
            Arc::new(StaticJwksFetcher { jwks_json }),
            Duration::from_secs(300),
            10,
        ));

        // Remap the identity claim to one the provider does not send.
        let store = configured_store();
        store.set_secret("cucumber", WS_PARENT, "claim-mapping", "employee_id");
        let strategy2 = OidcAuthenticator::new(
            Arc::new(store),
            provider.clone(),
            jwks,
            Duration::from_secs(300),
            60,
        );

        let redirect = strategy2.authorize(&webservice()).await.unwrap();
        *provider.nonce.lock().unwrap() = nonce_from_redirect(&redirect);

        let result = strategy2.verify(&callback_input(&redirect.state, "good-code")).await;
        assert!(matches!(result, Err(AuthnError::MissingClaim(c)) if c == "employee_id"));
    }
}
