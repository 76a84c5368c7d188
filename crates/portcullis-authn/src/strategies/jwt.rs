//! JWT bearer token authentication, the `authn-jwt` type.
//!
//! Stateless per call: verify the token against the instance's configured
//! key material and issuer, derive the identity from the identifying claim,
//! resolve exactly one host with that identifier, then check the host's
//! resource restrictions against the decoded claims. Ambiguity is always a
//! hard failure; with more than one matching host no token is issued.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use portcullis_store::PolicyStore;

use crate::{
    error::{AuthnError, Result},
    input::AuthenticatorInput,
    jwks::{Jwk, JwksCache, JwksSet},
    restrictions::{NonEmptyConstraint, RestrictionMatcher},
    strategies::{Authenticator, VerifiedIdentity, required_variable, variable},
    webservice::Webservice,
};

/// Asymmetric algorithms accepted for external tokens. Symmetric families
/// are rejected outright.
const ACCEPTED_ALGORITHMS: &[Algorithm] =
    &[Algorithm::EdDSA, Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Where this instance's verification keys come from.
enum KeySource {
    /// Remote JWKS endpoint, cached
    Remote(String),
    /// Key set stored directly as configuration
    Static(JwksSet),
}

/// Per-instance settings, loaded from the webservice's variables.
struct JwtSettings {
    key_source: KeySource,
    issuer: String,
    audience: Option<String>,
    identifying_claim: String,
}

impl JwtSettings {
    /// Loads settings for one webservice.
    ///
    /// Exactly one of `jwks-uri` and `public-keys` must be set. A variable
    /// that exists with an empty value is a configuration error, not an
    /// unset variable.
    async fn load(policy: &dyn PolicyStore, webservice: &Webservice) -> Result<Self> {
        let jwks_uri = variable(policy, webservice, "jwks-uri").await?;
        let public_keys = variable(policy, webservice, "public-keys").await?;
        let key_source = match (jwks_uri, public_keys) {
            (Some(uri), None) => KeySource::Remote(uri),
            (None, Some(json)) => KeySource::Static(JwksSet::from_json(&json)?),
            (None, None) => {
                return Err(AuthnError::MissingConfigurationVariable("jwks-uri".into()));
            }
            (Some(_), Some(_)) => {
                return Err(AuthnError::ConstraintViolation(
                    "only one of jwks-uri and public-keys may be set".into(),
                ));
            }
        };

        let issuer = required_variable(policy, webservice, "issuer").await?;
        let audience = variable(policy, webservice, "audience").await?;
        let identifying_claim = variable(policy, webservice, "identifying-claim")
            .await?
            .unwrap_or_else(|| "sub".to_string());

        Ok(Self { key_source, issuer, audience, identifying_claim })
    }
}

/// The `authn-jwt` strategy.
pub struct JwtAuthenticator {
    policy: Arc<dyn PolicyStore>,
    jwks: Arc<JwksCache>,
    clock_skew_secs: u64,
    max_age_secs: i64,
}

impl JwtAuthenticator {
    /// Creates the strategy.
    ///
    /// `clock_skew_secs` is the leeway applied to `exp`/`nbf`;
    /// `max_age_secs` bounds how far in the past `iat` may lie.
    pub fn new(
        policy: Arc<dyn PolicyStore>,
        jwks: Arc<JwksCache>,
        clock_skew_secs: u64,
        max_age_secs: u64,
    ) -> Self {
        Self { policy, jwks, clock_skew_secs, max_age_secs: max_age_secs as i64 }
    }

    async fn resolve_key(&self, source: &KeySource, kid: Option<&str>) -> Result<Jwk> {
        match (source, kid) {
            (KeySource::Remote(uri), Some(kid)) => self.jwks.key_by_id(uri, kid).await,
            (KeySource::Remote(uri), None) => {
                let set = self.jwks.key_set(uri).await?;
                single_key(&set)
            }
            (KeySource::Static(set), Some(kid)) => set
                .key_by_id(kid)
                .cloned()
                .ok_or_else(|| AuthnError::KeyNotFound(kid.to_string())),
            (KeySource::Static(set), None) => single_key(set),
        }
    }

    fn decode_claims(
        &self,
        token: &str,
        key: &DecodingKey,
        algorithm: Algorithm,
        settings: &JwtSettings,
    ) -> Result<serde_json::Value> {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.clock_skew_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[&settings.issuer]);
        match &settings.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let decoded = decode::<serde_json::Value>(token, key, &validation)?;
        let claims = decoded.claims;

        // jsonwebtoken does not bound token age; an ancient iat is rejected
        // here even when exp is still in the future.
        if let Some(iat) = claims.get("iat").and_then(serde_json::Value::as_i64) {
            if Utc::now().timestamp() - iat > self.max_age_secs {
                return Err(AuthnError::TokenTooOld);
            }
        }
        Ok(claims)
    }

    /// Finds the single host whose identifier matches the identifying claim.
    async fn resolve_host(&self, account: &str, identifier: &str) -> Result<portcullis_store::policy::Role> {
        let matches = self.policy.find_hosts_by_identifier(account, identifier).await?;
        let count = matches.len();
        let mut matches = matches.into_iter();
        match (matches.next(), count) {
            (Some(role), 1) => Ok(role),
            (None, _) => Err(AuthnError::RoleNotFound(identifier.to_string())),
            (Some(_), n) => Err(AuthnError::MultipleRoleMatches(identifier.to_string(), n)),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    fn name(&self) -> &'static str {
        "authn-jwt"
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<VerifiedIdentity> {
        let token = input
            .credentials
            .strip_prefix("jwt=")
            .ok_or_else(|| AuthnError::InvalidTokenFormat("expected jwt=<token> body".into()))?
            .trim();
        if token.is_empty() {
            return Err(AuthnError::InvalidTokenFormat("empty token".into()));
        }

        let webservice = input.webservice();
        let settings = JwtSettings::load(self.policy.as_ref(), &webservice).await?;

        let header = decode_header(token)?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(AuthnError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let jwk = self.resolve_key(&settings.key_source, header.kid.as_deref()).await?;
        let key_algorithm = jwk.algorithm()?;
        if key_algorithm != header.alg {
            return Err(AuthnError::UnsupportedAlgorithm(format!(
                "token alg {:?} does not match key alg {:?}",
                header.alg, key_algorithm
            )));
        }
        let decoding_key = jwk.to_decoding_key()?;

        let claims = self.decode_claims(token, &decoding_key, header.alg, &settings)?;

        let identifier = claims
            .get(settings.identifying_claim.as_str())
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AuthnError::MissingClaim(settings.identifying_claim.clone()))?
            .to_string();

        let host = self.resolve_host(&input.account, &identifier).await?;

        let matcher = RestrictionMatcher::new(self.policy.clone());
        let restrictions = matcher
            .extract(self.name(), webservice.service_id(), &host.role_id)
            .await?;
        matcher.validate(&restrictions, &NonEmptyConstraint, &claims)?;

        tracing::debug!(
            account = %input.account,
            identifier = %identifier,
            role_id = %host.role_id,
            "JWT verified"
        );
        Ok(VerifiedIdentity::new(host.login()))
    }
}

fn single_key(set: &JwksSet) -> Result<Jwk> {
    if set.keys.len() == 1 {
        Ok(set.keys[0].clone())
    } else {
        Err(AuthnError::InvalidTokenFormat(
            "token has no kid and the key set holds multiple keys".into(),
        ))
    }
}
